//! Error types and exit codes for dh-runner

use std::process::ExitCode;
use thiserror::Error;

/// Main error type for runner operations
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{message}")]
    Session { message: String },

    #[error("Failed to fetch table {name}: {message}")]
    Table { name: String, message: String },

    #[error("Failed to read results: {message}")]
    Payload { message: String },

    #[error("Timed out after {waited_ms}ms waiting for {path}")]
    StartupTimeout { path: String, waited_ms: u64 },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl RunnerError {
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    pub fn table(name: &str, message: impl std::fmt::Display) -> Self {
        Self::Table {
            name: name.to_string(),
            message: message.to_string(),
        }
    }

    pub fn payload(message: impl std::fmt::Display) -> Self {
        Self::Payload {
            message: message.to_string(),
        }
    }

    /// Convert error to the process exit code:
    /// - 1: Engine never became ready / IO error
    /// - 2: Session could not be opened / bad configuration
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::StartupTimeout { .. } => ExitCode::from(1),
            Self::Io(_) => ExitCode::from(1),
            Self::Session { .. } => ExitCode::from(2),
            Self::Config { .. } => ExitCode::from(2),
            Self::Json(_) | Self::Table { .. } | Self::Payload { .. } => ExitCode::from(2),
        }
    }
}

impl From<arrow::error::ArrowError> for RunnerError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::Session {
            message: format!("Arrow error: {err}"),
        }
    }
}

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;
