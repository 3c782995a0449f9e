use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the traceloom collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifies this collector node in logs and remote routing.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Worker stream configuration.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Persistence cycle configuration.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node_name: default_node_name(),
            stream: StreamConfig::default(),
            persistence: PersistenceConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Worker stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Worker shards per role. Default: 2.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Bounded inbound queue capacity per shard. Default: 10000.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Behavior when a shard's queue is full. Default: drop.
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            queue_capacity: default_queue_capacity(),
            backpressure: BackpressurePolicy::default(),
        }
    }
}

/// Behavior of tell when a worker's inbound queue is full.
///
/// `drop` rejects the record without blocking and counts it as dropped;
/// `wait` suspends the producer until the queue has room. There is never an
/// unbounded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    #[default]
    Drop,
    Wait,
}

/// Persistence cycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Interval between flush ticks. Default: 5s.
    #[serde(default = "default_persistence_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Deadline for a single storage read during merge-on-read. Default: 5s.
    #[serde(default = "default_dao_timeout", with = "humantime_serde")]
    pub dao_timeout: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            interval: default_persistence_interval(),
            dao_timeout: default_dao_timeout(),
        }
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Enable the health metrics HTTP server. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address, ":port" binds all interfaces. Default: ":9618".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            addr: default_health_addr(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_node_name() -> String {
    "traceloom-node".to_string()
}

fn default_shard_count() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_persistence_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_dao_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9618".to_string()
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            bail!("node_name is required");
        }

        if self.stream.shard_count == 0 {
            bail!("stream.shard_count must be positive");
        }

        if self.stream.queue_capacity == 0 {
            bail!("stream.queue_capacity must be positive");
        }

        if self.persistence.interval.is_zero() {
            bail!("persistence.interval must be positive");
        }

        if self.persistence.dao_timeout.is_zero() {
            bail!("persistence.dao_timeout must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health.enabled is true");
        }

        Ok(())
    }
}
