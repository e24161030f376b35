//! Common test utilities and fixtures for dh-runner integration tests
//!
//! This module provides:
//! - `MockSession`, a scripted in-memory engine that understands wrapper programs
//! - `OutputBuffer`, a shared writer that collects protocol lines
//! - Table builders and a few protocol assertions
//! - Paths to the Python fixtures, and a check for a usable `python3`

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod mock_session;
pub mod output;

pub use mock_session::{int_table, MockSession, Outcome};
pub use output::OutputBuffer;

use std::path::PathBuf;
use std::process::{Command, Stdio};

use dh_runner::{DaemonConfig, ServerIdentity};

/// Config with fast polling for tests
pub fn fast_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.subscription.poll_interval_ms = 20;
    config.subscription.cancel_grace_ms = 500;
    config
}

pub fn identity(config: &DaemonConfig) -> ServerIdentity {
    ServerIdentity::new(config, 10000, Some("0.36.1".to_string()))
}

/// File under `tests/fixtures`
pub fn fixture(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(relative)
}

/// Whether `python3` can be started; tests that need it skip otherwise
pub fn python3_available() -> bool {
    let found = Command::new("python3")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success());
    if !found {
        eprintln!("python3 not found; skipping");
    }
    found
}
