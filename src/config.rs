//! Application configuration
//!
//! Loaded from a TOML file; every knob has a default so an empty file (or
//! no file at all) yields a runnable development configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::domain_types::{
    DeliveryAttemptCap, DispatchRetryLimit, MaxConcurrentTasks, QueueCapacity, ReplayLimit,
    StaleAfterSecs, SweepIntervalSecs, WorkerCount,
};

/// Configuration load/validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// SQLite storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
    pub pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "scanmaster.db".to_string(),
            pool_size: 20,
        }
    }
}

/// Heartbeat staleness and sweeper cadence
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LivenessConfig {
    pub stale_after_secs: StaleAfterSecs,
    pub sweep_interval_secs: SweepIntervalSecs,
}

/// Scoring weights for candidate selection.
///
/// Chosen for balance; the deterministic tie-break on `agent_id` is what
/// keeps test runs reproducible, not the weights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub load: f64,
    pub tasks: f64,
    pub recency: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            load: 0.5,
            tasks: 0.3,
            recency: 0.2,
        }
    }
}

/// Task dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub workers: u32,
    pub queue_capacity: QueueCapacity,
    pub retry_limit: DispatchRetryLimit,
    pub delivery_attempt_cap: DeliveryAttemptCap,
    pub max_concurrent_tasks: MaxConcurrentTasks,
    pub weights: ScoringWeights,
    /// Outbound Agent call deadline, seconds
    pub agent_timeout_secs: u64,
    /// Cross-component call deadline, seconds
    pub request_deadline_secs: u64,
    /// Optional static bearer token for Master->Agent calls
    pub agent_token: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: QueueCapacity::default(),
            retry_limit: DispatchRetryLimit::default(),
            delivery_attempt_cap: DeliveryAttemptCap::default(),
            max_concurrent_tasks: MaxConcurrentTasks::default(),
            weights: ScoringWeights::default(),
            agent_timeout_secs: 10,
            request_deadline_secs: 30,
            agent_token: None,
        }
    }
}

/// ETL pipeline settings.
///
/// The normalizer pool is bounded by the storage connection pool;
/// oversubscription produces lock-wait storms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub workers: u32,
    pub replay_limit: ReplayLimit,
    /// Polling interval for pending raw rows, milliseconds
    pub poll_interval_ms: u64,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            replay_limit: ReplayLimit::default(),
            poll_interval_ms: 500,
        }
    }
}

/// Capability/tag catalog cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub cache_ttl_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 60 }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub liveness: LivenessConfig,
    pub dispatcher: DispatcherConfig,
    pub etl: EtlConfig,
    pub catalog: CatalogConfig,
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or if
    /// a value fails validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_display = path.as_ref().display().to_string();
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path_display.clone(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` on the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "storage.pool_size".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.dispatcher.workers == 0 || self.dispatcher.workers > 64 {
            return Err(ConfigError::Invalid {
                field: "dispatcher.workers".into(),
                reason: "must be between 1 and 64".into(),
            });
        }
        if self.etl.workers == 0 || self.etl.workers > 64 {
            return Err(ConfigError::Invalid {
                field: "etl.workers".into(),
                reason: "must be between 1 and 64".into(),
            });
        }
        if self.etl.workers > self.storage.pool_size {
            return Err(ConfigError::Invalid {
                field: "etl.workers".into(),
                reason: format!(
                    "normalizer pool ({}) must not exceed the storage pool ({})",
                    self.etl.workers, self.storage.pool_size
                ),
            });
        }
        let weights = self.dispatcher.weights;
        for (name, value) in [
            ("load", weights.load),
            ("tasks", weights.tasks),
            ("recency", weights.recency),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid {
                    field: format!("dispatcher.weights.{name}"),
                    reason: "must be a non-negative finite number".into(),
                });
            }
        }
        Ok(())
    }

    /// Dispatcher worker count clamped to available cores
    pub fn dispatcher_workers(&self) -> WorkerCount {
        Self::clamped_workers(self.dispatcher.workers)
    }

    /// Normalizer worker count clamped to available cores
    pub fn etl_workers(&self) -> WorkerCount {
        Self::clamped_workers(self.etl.workers)
    }

    fn clamped_workers(requested: u32) -> WorkerCount {
        let cores = num_cpus::get().max(1);
        let count = (requested as usize).min(cores * 2).max(1);
        WorkerCount::try_new(count.min(64)).unwrap_or_else(|_| {
            // 1 is always inside the validated range
            WorkerCount::try_new(1).unwrap()
        })
    }
}
