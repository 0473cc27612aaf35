// src/utils/config.rs
//! Engine configuration
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults (every section is `#[serde(default)]`)
//! 2. Optional file named by `ENGINE_CONFIG` (default `engine.{toml,yaml,json}`)
//! 3. Environment variables, e.g. `ENGINE_WORKERS__COUNT=8`

use crate::monitoring::thresholds::AlertThresholds;
use crate::storage::StorageConfig;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "ENGINE_CONFIG";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: WorkerConfig,
    pub control: ControlConfig,

    /// Domain name → pool bounds. The key set is fixed for the engine's lifetime.
    pub pools: PoolsConfig,

    pub thresholds: AlertThresholds,
    pub storage: StorageSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker threads
    pub count: usize,

    /// How long an idle worker blocks on the queue before re-checking shutdown
    pub poll_timeout_ms: u64,

    /// Pause after requeueing a task that found no capacity
    pub requeue_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 5,
            poll_timeout_ms: 1000,
            requeue_backoff_ms: 250,
        }
    }
}

impl WorkerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn requeue_backoff(&self) -> Duration {
        Duration::from_millis(self.requeue_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub autoscale_interval_secs: u64,
    pub health_interval_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            autoscale_interval_secs: 30,
            health_interval_secs: 60,
        }
    }
}

impl ControlConfig {
    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_secs(self.autoscale_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

/// Bounds for one domain pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_agents: usize,
    pub max_agents: usize,

    /// Agents provisioned at startup (clamped into `[min, max]`)
    pub target_agents: usize,

    #[serde(default = "default_auto_scale")]
    pub auto_scale: bool,
}

fn default_auto_scale() -> bool {
    true
}

impl PoolConfig {
    pub fn new(min_agents: usize, max_agents: usize, target_agents: usize) -> Self {
        Self {
            min_agents,
            max_agents,
            target_agents,
            auto_scale: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolsConfig(pub BTreeMap<String, PoolConfig>);

impl Default for PoolsConfig {
    fn default() -> Self {
        let mut pools = BTreeMap::new();
        pools.insert("healthcare".to_string(), PoolConfig::new(1, 10, 3));
        pools.insert("financial".to_string(), PoolConfig::new(1, 8, 3));
        pools.insert("sports".to_string(), PoolConfig::new(1, 6, 2));
        pools.insert("business".to_string(), PoolConfig::new(1, 12, 4));
        pools.insert("general".to_string(), PoolConfig::new(2, 15, 5));
        Self(pools)
    }
}

impl PoolsConfig {
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PoolConfig)> {
        self.0.iter()
    }

    pub fn get(&self, domain: &str) -> Option<&PoolConfig> {
        self.0.get(domain)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,

    /// SQLite database file (sqlite backend only)
    pub path: PathBuf,

    pub busy_timeout_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("taskflow.db"),
            busy_timeout_ms: 5000,
        }
    }
}

impl StorageSettings {
    pub fn sqlite_config(&self) -> StorageConfig {
        StorageConfig {
            path: self.path.clone(),
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    pub log_level: String,

    pub log_format: LogFormat,

    /// Prometheus scrape listener, disabled when unset
    pub metrics_addr: Option<SocketAddr>,

    /// Sample host CPU/memory/disk; when false the monitor sees zeros
    pub sample_system: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_addr: None,
            sample_system: true,
        }
    }
}

impl EngineConfig {
    /// Load defaults, then the optional config file, then `ENGINE_*` env vars
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "engine".to_string());

        let config: EngineConfig = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("ENGINE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers.count == 0 {
            return Err(EngineError::Config("workers.count must be at least 1".into()));
        }
        if self.workers.poll_timeout_ms == 0 {
            return Err(EngineError::Config(
                "workers.poll_timeout_ms must be positive".into(),
            ));
        }
        if self.control.autoscale_interval_secs == 0 || self.control.health_interval_secs == 0 {
            return Err(EngineError::Config(
                "control intervals must be positive".into(),
            ));
        }
        if self.pools.is_empty() {
            return Err(EngineError::Config("at least one pool is required".into()));
        }

        for (domain, pool) in self.pools.iter() {
            if domain.trim().is_empty() {
                return Err(EngineError::Config("pool domain cannot be empty".into()));
            }
            if pool.max_agents == 0 {
                return Err(EngineError::Config(format!(
                    "pool {}: max_agents cannot be 0",
                    domain
                )));
            }
            if pool.min_agents > pool.max_agents {
                return Err(EngineError::Config(format!(
                    "pool {}: min_agents {} exceeds max_agents {}",
                    domain, pool.min_agents, pool.max_agents
                )));
            }
        }

        self.thresholds.validate().map_err(EngineError::Config)?;
        Ok(())
    }
}
