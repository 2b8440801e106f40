//! Configuration types for fairq

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for configuration overrides (`FAIRQ_QUEUE__MAX_HISTORY=100`)
pub const ENV_PREFIX: &str = "FAIRQ";

/// Main daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Filesystem locations
    pub paths: PathsConfig,
    /// Scheduler loop configuration
    pub queue: QueueConfig,
    /// Ingestion pipeline configuration
    pub ingest: IngestConfig,
    /// Container runtime configuration
    pub runtime: RuntimeConfig,
    /// GPU inventory configuration
    pub gpu: GpuConfig,
    /// API server configuration
    pub api: ApiConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from an optional TOML file, then apply `FAIRQ_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, crate::FairqError> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ingest.executors")
                .with_list_parse_key("runtime.mounts")
                .with_list_parse_key("gpu.devices"),
        );

        let settings = builder.build()?;
        let config: DaemonConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, crate::FairqError> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<(), crate::FairqError> {
        if self.queue.max_history == 0 {
            return Err(crate::FairqError::Config(
                "queue.max_history must be at least 1".to_string(),
            ));
        }
        if self.queue.dispatch_per_cycle == 0 {
            return Err(crate::FairqError::Config(
                "queue.dispatch_per_cycle must be at least 1".to_string(),
            ));
        }
        for mount in &self.runtime.mounts {
            if mount.split(':').count() != 2 {
                return Err(crate::FairqError::Config(format!(
                    "mount '{}' must have the form source:target",
                    mount
                )));
            }
        }
        Ok(())
    }
}

/// Filesystem locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where users drop job bundles
    pub inbound: PathBuf,
    /// Local staging area bundles are moved to before building
    pub staging: PathBuf,
    /// Bundles whose image build failed
    pub failed: PathBuf,
    /// Directory holding the three queue snapshots
    pub state: PathBuf,
    /// Directory for collected container output
    pub logs: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            inbound: PathBuf::from("/var/lib/fairq/inbound"),
            staging: PathBuf::from("/var/lib/fairq/staging"),
            failed: PathBuf::from("/var/lib/fairq/failed"),
            state: PathBuf::from("/var/lib/fairq/state"),
            logs: PathBuf::from("/var/log/fairq/jobs"),
        }
    }
}

/// Scheduler loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of finished jobs kept in history
    pub max_history: usize,
    /// Seconds between scheduler cycles
    pub sleep_secs: u64,
    /// Milliseconds between checks while the queue is locked
    pub lock_poll_millis: u64,
    /// Maximum number of jobs started per cycle
    pub dispatch_per_cycle: usize,
}

impl QueueConfig {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_millis)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_history: 500,
            sleep_secs: 10,
            lock_poll_millis: 1000,
            dispatch_per_cycle: 1,
        }
    }
}

/// How the ingestion pipeline is hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Child process streaming tickets over stdout
    Subprocess,
    /// Tokio task inside the daemon
    Task,
}

impl std::fmt::Display for IngestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestMode::Subprocess => write!(f, "subprocess"),
            IngestMode::Task => write!(f, "task"),
        }
    }
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Users allowed to submit jobs
    pub executors: Vec<String>,
    /// Delete rejected bundles instead of moving them to the invalid folder
    pub remove_invalid: bool,
    /// Seconds between passes over the inbound location
    pub sleep_secs: u64,
    /// Hosting mode
    pub mode: IngestMode,
}

impl IngestConfig {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_secs)
    }

    /// Flat allow-list lookup
    pub fn is_authorized(&self, executor: &str) -> bool {
        self.executors.iter().any(|e| e == executor)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            executors: Vec::new(),
            remove_invalid: false,
            sleep_secs: 10,
            mode: IngestMode::Subprocess,
        }
    }
}

/// Container runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Path to the docker client binary
    pub docker_binary: PathBuf,
    /// Bind mounts applied to every container (`source:target`)
    pub mounts: Vec<String>,
    /// Network mode for created containers
    pub network_mode: Option<String>,
    /// Remove containers once their final output has been collected
    pub auto_remove: bool,
    /// Shared memory size
    pub shm_size: String,
    /// Seconds between container output collections
    pub log_interval_secs: u64,
}

impl RuntimeConfig {
    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_binary: PathBuf::from("docker"),
            mounts: Vec::new(),
            network_mode: Some("host".to_string()),
            auto_remove: true,
            shm_size: "1g".to_string(),
            log_interval_secs: 10,
        }
    }
}

/// GPU inventory configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Directory scanned for `nvidia<N>` device nodes
    pub dev_dir: PathBuf,
    /// Explicit device list, skips the scan when set
    pub devices: Option<Vec<u32>>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            devices: None,
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.api.port, 9090);
        assert_eq!(config.queue.max_history, 500);
        assert_eq!(config.queue.dispatch_per_cycle, 1);
        assert_eq!(config.ingest.mode, IngestMode::Subprocess);
        assert!(config.gpu.devices.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml_str = r#"
[queue]
max_history = 3

[ingest]
executors = ["ilja", "markus"]
mode = "task"

[gpu]
devices = [0, 1]
"#;
        let config = DaemonConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.queue.max_history, 3);
        assert_eq!(config.queue.sleep_secs, 10);
        assert!(config.ingest.is_authorized("ilja"));
        assert!(!config.ingest.is_authorized("mallory"));
        assert_eq!(config.ingest.mode, IngestMode::Task);
        assert_eq!(config.gpu.devices, Some(vec![0, 1]));
        assert_eq!(config.runtime.shm_size, "1g");
    }

    #[test]
    fn test_rejects_zero_history() {
        let result = DaemonConfig::from_toml("[queue]\nmax_history = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_malformed_mount() {
        let result = DaemonConfig::from_toml("[runtime]\nmounts = [\"/data\"]\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[api]\nport = 7070\n\n[paths]\nstate = \"/tmp/fairq-state\"").unwrap();

        let config = DaemonConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.api.port, 7070);
        assert_eq!(config.paths.state, PathBuf::from("/tmp/fairq-state"));
        assert_eq!(config.paths.inbound, PathBuf::from("/var/lib/fairq/inbound"));
    }
}
