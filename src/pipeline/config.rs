//! Runtime configuration from environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Analytical store connection parameters
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite file holding fact tables and provisioning metadata
    pub db_path: String,

    /// Maximum idle connections kept by the pool
    pub pool_size: usize,
}

/// Topic provisioning parameters
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Path to the SQLite file backing the durable log
    pub broker_path: String,

    /// Partitions per topic, fixed once the topic exists
    pub partitions: u32,

    /// Replication factor recorded with each topic
    pub replication_factor: u32,
}

/// Ingestion bridge and materializer tuning
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Idle delay between polls once the staging relation is drained
    pub poll_interval: Duration,

    /// Maximum records pulled from the log per cycle
    pub batch_size: usize,

    /// Malformed records tolerated per polled batch
    pub skip_broken_messages: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 1000,
            skip_broken_messages: 1,
        }
    }
}

/// Configuration for the statistics runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub provisioning: ProvisioningConfig,
    pub ingest: IngestConfig,

    /// Listen address for the query service
    pub server_addr: String,
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `POSTFLOW_DB_PATH` (default: data/statistics.db)
    /// - `POSTFLOW_BROKER_PATH` (default: data/broker.db)
    /// - `POSTFLOW_POOL_SIZE` (default: 8)
    /// - `POSTFLOW_SERVER_ADDR` (default: 0.0.0.0:50052)
    /// - `TOPIC_PARTITIONS` (default: 1)
    /// - `TOPIC_REPLICATION_FACTOR` (default: 1)
    /// - `INGEST_POLL_INTERVAL_MS` (default: 500)
    /// - `INGEST_BATCH_SIZE` (default: 1000)
    /// - `INGEST_SKIP_BROKEN_MESSAGES` (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let pool_size = parse_var("POSTFLOW_POOL_SIZE", 8usize)?;
        let partitions = parse_var("TOPIC_PARTITIONS", 1u32)?;
        let batch_size = parse_var("INGEST_BATCH_SIZE", 1000usize)?;

        if pool_size == 0 {
            return Err(ConfigError::InvalidValue("POSTFLOW_POOL_SIZE must be at least 1".to_string()));
        }
        if partitions == 0 {
            return Err(ConfigError::InvalidValue("TOPIC_PARTITIONS must be at least 1".to_string()));
        }
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue("INGEST_BATCH_SIZE must be at least 1".to_string()));
        }

        Ok(Self {
            store: StoreConfig {
                db_path: env::var("POSTFLOW_DB_PATH")
                    .unwrap_or_else(|_| "data/statistics.db".to_string()),
                pool_size,
            },
            provisioning: ProvisioningConfig {
                broker_path: env::var("POSTFLOW_BROKER_PATH")
                    .unwrap_or_else(|_| "data/broker.db".to_string()),
                partitions,
                replication_factor: parse_var("TOPIC_REPLICATION_FACTOR", 1u32)?,
            },
            ingest: IngestConfig {
                poll_interval: Duration::from_millis(parse_var("INGEST_POLL_INTERVAL_MS", 500u64)?),
                batch_size,
                skip_broken_messages: parse_var("INGEST_SKIP_BROKEN_MESSAGES", 1usize)?,
            },
            server_addr: env::var("POSTFLOW_SERVER_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:50052".to_string()),
        })
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{} = '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}
