//! Configuration for brokers, coordinators and workers
//!
//! Configuration is resolved in three layers: built-in defaults, an optional
//! TOML file, then `BROKERMR_*` environment variables. The merged result is
//! validated before anything connects to a broker.
//!
//! ```toml
//! [broker]
//! backend = "redis"
//! url = "redis://127.0.0.1:6379"
//!
//! [coordinator]
//! workers = 8
//! partition_timeout = "30s"
//! max_attempts = 3
//!
//! [worker]
//! max_deliveries = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::coordinator::PartitionStrategy;
use crate::error::{ErrorCode, ErrorExt, MapReduceError, MapReduceResult};

/// File picked up from the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "brokermr.toml";

pub const ENV_BROKER_BACKEND: &str = "BROKERMR_BROKER_BACKEND";
pub const ENV_BROKER_URL: &str = "BROKERMR_BROKER_URL";
pub const ENV_WORKERS: &str = "BROKERMR_WORKERS";
pub const ENV_PARTITION_TIMEOUT: &str = "BROKERMR_PARTITION_TIMEOUT";

/// Broker backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// In-process broker (default)
    #[default]
    Memory,
    /// Redis reliable queues
    Redis,
}

impl std::str::FromStr for BrokerBackend {
    type Err = MapReduceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(MapReduceError::configuration_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("Unknown broker backend '{}'", other),
            )),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerMrConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,

    /// Connection URL, required by the redis backend
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for every key the redis backend writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Consumers that miss their heartbeat for this long are presumed dead
    #[serde(with = "humantime_serde", default = "default_heartbeat_ttl")]
    pub heartbeat_ttl: Duration,

    /// Upper bound on a single blocking wait for a message
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            url: None,
            key_prefix: default_key_prefix(),
            pool_size: default_pool_size(),
            heartbeat_ttl: default_heartbeat_ttl(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Worker count used to size partitions
    #[serde(default = "default_workers")]
    pub workers: u32,

    #[serde(default)]
    pub strategy: PartitionStrategy,

    /// Republish a partition whose reply has not arrived within this window
    #[serde(with = "humantime_serde", default)]
    pub partition_timeout: Option<Duration>,

    /// Dispatches per partition before the run fails; only used with a timeout
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Unacknowledged replies the coordinator may hold
    #[serde(default = "default_reply_prefetch")]
    pub reply_prefetch: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            strategy: PartitionStrategy::default(),
            partition_timeout: None,
            max_attempts: default_max_attempts(),
            reply_prefetch: default_reply_prefetch(),
        }
    }
}

/// Worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Deliveries after which a message is quarantined; `None` disables
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: Option<u32>,

    #[serde(default = "default_quarantine_suffix")]
    pub quarantine_suffix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_deliveries: default_max_deliveries(),
            quarantine_suffix: default_quarantine_suffix(),
        }
    }
}

// Default value functions
fn default_key_prefix() -> String {
    "brokermr:".to_string()
}

fn default_pool_size() -> usize {
    8
}

fn default_heartbeat_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_workers() -> u32 {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_reply_prefetch() -> usize {
    64
}

fn default_max_deliveries() -> Option<u32> {
    Some(5)
}

fn default_quarantine_suffix() -> String {
    ".quarantine".to_string()
}

impl BrokerMrConfig {
    /// Load configuration from `path`, or from `brokermr.toml` in the working
    /// directory when present, then apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> MapReduceResult<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        let config = config.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without overrides or validation
    pub fn from_file(path: &Path) -> MapReduceResult<Self> {
        debug!("Loading configuration from {}", path.display());
        let contents = std::fs::read_to_string(path)
            .map_err(|e| MapReduceError::from(e).with_context(path.display()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> MapReduceResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `BROKERMR_*` environment variables on top of this configuration
    pub fn with_env_overrides(self) -> MapReduceResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> MapReduceResult<Self> {
        if let Some(backend) = lookup(ENV_BROKER_BACKEND) {
            self.broker.backend = backend.parse()?;
        }
        if let Some(url) = lookup(ENV_BROKER_URL) {
            self.broker.url = Some(url);
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            self.coordinator.workers = workers
                .trim()
                .parse()
                .to_config_error(format!("{} must be a positive integer", ENV_WORKERS))?;
        }
        if let Some(timeout) = lookup(ENV_PARTITION_TIMEOUT) {
            let timeout = humantime_serde::re::humantime::parse_duration(timeout.trim())
                .to_config_error(format!(
                    "{} must be a duration such as 30s",
                    ENV_PARTITION_TIMEOUT
                ))?;
            self.coordinator.partition_timeout = Some(timeout);
        }
        Ok(self)
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> MapReduceResult<()> {
        let invalid = |message: &str| {
            Err(MapReduceError::configuration_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                message,
            ))
        };

        if self.coordinator.workers == 0 {
            return invalid("coordinator.workers must be greater than 0");
        }
        if self.coordinator.max_attempts == 0 {
            return invalid("coordinator.max_attempts must be greater than 0");
        }
        if self.coordinator.reply_prefetch == 0 {
            return invalid("coordinator.reply_prefetch must be greater than 0");
        }
        if self.coordinator.partition_timeout == Some(Duration::ZERO) {
            return invalid("coordinator.partition_timeout must be greater than 0");
        }
        if self.worker.max_deliveries == Some(0) {
            return invalid("worker.max_deliveries must be greater than 0");
        }
        if self.worker.quarantine_suffix.is_empty() {
            return invalid("worker.quarantine_suffix must not be empty");
        }
        if self.broker.backend == BrokerBackend::Redis && self.broker.url.is_none() {
            return invalid("broker.url is required for the redis backend");
        }
        if self.broker.pool_size == 0 {
            return invalid("broker.pool_size must be greater than 0");
        }
        Ok(())
    }
}
