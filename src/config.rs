//! Runner configuration
//!
//! Built in three layers: serde defaults, then an optional TOML file, then
//! command-line flags (see [`crate::cli`]).
//!
//! ```toml
//! mode = "vm"
//! port = 10000
//! listen = "0.0.0.0:5000"
//!
//! [handshake]
//! ready_timeout_ms = 600000
//!
//! [subscription]
//! poll_interval_ms = 2000
//!
//! [engine]
//! command = ["python3", "/opt/dh-runner/bridge/dh-bridge"]
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};

/// Marker the host orchestrator writes once the engine is up (vm mode)
pub const VM_ENGINE_READY_MARKER: &str = "/tmp/dh_ready";
/// Marker the runner writes once its session is warm (vm mode)
pub const VM_RUNNER_READY_MARKER: &str = "/tmp/runner_ready";

/// How the runner is deployed relative to the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    /// Engine started alongside the runner on this host
    #[default]
    Embedded,
    /// Engine reached over the network
    Remote,
    /// Runner inside a snapshot-restorable guest VM
    Vm,
}

impl fmt::Display for RunnerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embedded => write!(f, "embedded"),
            Self::Remote => write!(f, "remote"),
            Self::Vm => write!(f, "vm"),
        }
    }
}

/// Complete runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub mode: RunnerMode,

    /// Engine host
    #[serde(default = "default_host")]
    pub host: String,

    /// Engine port
    #[serde(default = "default_port")]
    pub port: u16,

    /// TCP address to serve on; stdio when unset
    #[serde(default)]
    pub listen: Option<String>,

    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub subscription: SubscriptionConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    10000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            mode: RunnerMode::default(),
            host: default_host(),
            port: default_port(),
            listen: None,
            handshake: HandshakeConfig::default(),
            subscription: SubscriptionConfig::default(),
            fetch: FetchConfig::default(),
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Readiness marker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// File whose appearance means the engine is up
    #[serde(default)]
    pub engine_ready_marker: Option<PathBuf>,

    /// File touched once the runner is ready to serve
    #[serde(default)]
    pub runner_ready_marker: Option<PathBuf>,

    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    #[serde(default = "default_marker_poll_ms")]
    pub marker_poll_ms: u64,
}

fn default_ready_timeout_ms() -> u64 {
    600_000
}

fn default_marker_poll_ms() -> u64 {
    100
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            engine_ready_marker: None,
            runner_ready_marker: None,
            ready_timeout_ms: default_ready_timeout_ms(),
            marker_poll_ms: default_marker_poll_ms(),
        }
    }
}

/// Background poller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Longest a replacement waits for the old poller to stop
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    #[serde(default = "default_subscribe_limit")]
    pub default_limit: usize,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_cancel_grace_ms() -> u64 {
    500
}

fn default_subscribe_limit() -> usize {
    crate::protocol::DEFAULT_SUBSCRIBE_LIMIT
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            default_limit: default_subscribe_limit(),
        }
    }
}

impl SubscriptionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_limit")]
    pub default_limit: usize,
}

fn default_fetch_limit() -> usize {
    crate::protocol::DEFAULT_FETCH_LIMIT
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_fetch_limit(),
        }
    }
}

/// Engine bridge process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Program and arguments of the bridge; the default `dh-bridge` is the
    /// repository's `bridge/dh-bridge` script installed on `PATH`
    #[serde(default = "default_engine_command")]
    pub command: Vec<String>,
}

fn default_engine_command() -> Vec<String> {
    vec!["dh-bridge".to_string()]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RunnerError::Config {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RunnerError::Config {
            message: format!("Failed to parse config: {}", e),
        })
    }

    /// Engine-ready marker, falling back to the vm-mode path
    pub fn engine_ready_marker(&self) -> Option<PathBuf> {
        self.handshake.engine_ready_marker.clone().or_else(|| {
            (self.mode == RunnerMode::Vm).then(|| PathBuf::from(VM_ENGINE_READY_MARKER))
        })
    }

    /// Runner-ready marker, falling back to the vm-mode path
    pub fn runner_ready_marker(&self) -> Option<PathBuf> {
        self.handshake.runner_ready_marker.clone().or_else(|| {
            (self.mode == RunnerMode::Vm).then(|| PathBuf::from(VM_RUNNER_READY_MARKER))
        })
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake.ready_timeout_ms)
    }

    pub fn marker_poll(&self) -> Duration {
        Duration::from_millis(self.handshake.marker_poll_ms.max(1))
    }

    /// Host reported by `server_info`
    pub fn advertised_host(&self) -> &str {
        match self.mode {
            RunnerMode::Remote => &self.host,
            RunnerMode::Embedded | RunnerMode::Vm => "localhost",
        }
    }

    /// Default tracing directive for this crate
    pub fn log_directive(&self) -> String {
        format!("dh_runner={}", self.logging.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.port, 10000);
        assert_eq!(config.subscription.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.subscription.default_limit, 200);
        assert_eq!(config.fetch.default_limit, 50);
        assert_eq!(config.engine_ready_marker(), None);
        assert_eq!(config.log_directive(), "dh_runner=info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = DaemonConfig::from_toml(
            "mode = \"remote\"\nhost = \"engine.internal\"\n[subscription]\npoll_interval_ms = 50\n",
        )
        .unwrap();
        assert_eq!(config.mode, RunnerMode::Remote);
        assert_eq!(config.subscription.poll_interval_ms, 50);
        assert_eq!(config.subscription.cancel_grace_ms, 500);
        assert_eq!(config.handshake.ready_timeout_ms, 600_000);
        assert_eq!(config.advertised_host(), "engine.internal");
    }

    #[test]
    fn test_vm_mode_marker_defaults() {
        let config = DaemonConfig {
            mode: RunnerMode::Vm,
            ..DaemonConfig::default()
        };
        assert_eq!(
            config.engine_ready_marker(),
            Some(PathBuf::from("/tmp/dh_ready"))
        );
        assert_eq!(
            config.runner_ready_marker(),
            Some(PathBuf::from("/tmp/runner_ready"))
        );
        assert_eq!(config.advertised_host(), "localhost");
    }

    #[test]
    fn test_explicit_marker_wins() {
        let config = DaemonConfig::from_toml(
            "mode = \"vm\"\n[handshake]\nengine_ready_marker = \"/run/engine\"\n",
        )
        .unwrap();
        assert_eq!(config.engine_ready_marker(), Some(PathBuf::from("/run/engine")));
        assert_eq!(
            config.runner_ready_marker(),
            Some(PathBuf::from(VM_RUNNER_READY_MARKER))
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 10123\n[engine]\ncommand = [\"python3\", \"bridge.py\"]").unwrap();
        let config = DaemonConfig::load_from(file.path()).unwrap();
        assert_eq!(config.port, 10123);
        assert_eq!(config.engine.command, vec!["python3", "bridge.py"]);
    }

    #[test]
    fn test_bad_file_is_config_error() {
        assert!(matches!(
            DaemonConfig::from_toml("port = \"not a number\""),
            Err(RunnerError::Config { .. })
        ));
        assert!(matches!(
            DaemonConfig::load_from(Path::new("/nonexistent/dh-runner.toml")),
            Err(RunnerError::Config { .. })
        ));
    }
}
