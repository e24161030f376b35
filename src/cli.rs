//! CLI argument definitions

use std::path::PathBuf;

use clap::Parser;

use crate::config::{DaemonConfig, RunnerMode};
use crate::error::Result;

/// dh-runner: execution daemon for a table-engine session
#[derive(Parser, Debug, Default)]
#[command(name = "dh-runner")]
#[command(version)]
#[command(about = "Runs user code against a table-engine session over a JSON-lines protocol")]
pub struct Args {
    /// TOML configuration file
    #[arg(long, env = "DH_RUNNER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Deployment mode
    #[arg(long, value_enum, env = "DH_RUNNER_MODE")]
    pub mode: Option<RunnerMode>,

    /// Engine host
    #[arg(long, env = "DH_RUNNER_HOST")]
    pub host: Option<String>,

    /// Engine port
    #[arg(short, long, env = "DH_RUNNER_PORT")]
    pub port: Option<u16>,

    /// Serve on this TCP address instead of stdio
    #[arg(long, env = "DH_RUNNER_LISTEN")]
    pub listen: Option<String>,

    /// Wait for this file before connecting to the engine
    #[arg(long, env = "DH_RUNNER_ENGINE_READY_MARKER")]
    pub engine_ready_marker: Option<PathBuf>,

    /// Touch this file once the session is connected
    #[arg(long, env = "DH_RUNNER_READY_MARKER")]
    pub runner_ready_marker: Option<PathBuf>,

    /// Give up waiting for the engine after this many milliseconds
    #[arg(long, env = "DH_RUNNER_READY_TIMEOUT_MS")]
    pub ready_timeout_ms: Option<u64>,

    /// Subscription poll interval in milliseconds
    #[arg(long, env = "DH_RUNNER_POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Engine bridge command line (program followed by its arguments)
    #[arg(long, num_args = 1.., value_delimiter = ' ', env = "DH_RUNNER_ENGINE_CMD")]
    pub engine_cmd: Option<Vec<String>>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "DH_RUNNER_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl Args {
    /// Defaults, then the config file, then these flags
    pub fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load_from(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(listen) = self.listen {
            config.listen = Some(listen);
        }
        if let Some(path) = self.engine_ready_marker {
            config.handshake.engine_ready_marker = Some(path);
        }
        if let Some(path) = self.runner_ready_marker {
            config.handshake.runner_ready_marker = Some(path);
        }
        if let Some(ms) = self.ready_timeout_ms {
            config.handshake.ready_timeout_ms = ms;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.subscription.poll_interval_ms = ms;
        }
        if let Some(command) = self.engine_cmd {
            config.engine.command = command;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        Ok(config)
    }
}
