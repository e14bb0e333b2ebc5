//! Node configuration.
//!
//! Centralized configuration with layered sources, highest priority first:
//! environment variables (prefix `LATTICE__`), an optional TOML file, and
//! built-in defaults.
//!
//! # Environment Variables
//!
//! - `LATTICE__NODE__NODE_ID=node-1`
//! - `LATTICE__STORE__DIMENSIONS=768`
//! - `LATTICE__CLUSTER__REPLICATION_FACTOR=3`
//! - `LATTICE__TRANSFER__MAX_CONCURRENT=5`
//! - `LATTICE__LOGGING__LEVEL=debug`

use crate::coordinator::RebalanceConfig;
use crate::membership::MembershipConfig;
use crate::store::StoreConfig;
use crate::transfer::RetryConfig;
use lattice_core::{DistanceMetric, NodeId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration for a LatticeDB node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub store: StoreSection,
    pub cluster: ClusterSection,
    pub transfer: TransferSection,
    pub logging: LoggingSection,
}

/// Node identity and addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Required unique node identifier.
    pub node_id: String,
    /// Address the HTTP surface binds to.
    pub http_address: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            http_address: "127.0.0.1:7700".to_string(),
        }
    }
}

/// Local store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Vector dimensionality.
    pub dimensions: usize,
    /// One of `cosine`, `dot`, `euclidean`, `manhattan`.
    pub distance_function: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            dimensions: 768,
            distance_function: "cosine".to_string(),
        }
    }
}

/// Ring and membership settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Virtual tokens per node.
    pub virtual_nodes: usize,
    /// Distinct replicas per vector id.
    pub replication_factor: usize,
    /// Quiet period before a rebalance trigger fires, in seconds.
    pub stabilization_window_secs: u64,
    /// Heartbeat age after which a node is considered failed, in seconds.
    pub liveness_window_secs: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            virtual_nodes: 256,
            replication_factor: 3,
            stabilization_window_secs: 30,
            liveness_window_secs: 30,
        }
    }
}

/// Transfer orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    /// Simultaneously running transfer tasks.
    pub max_concurrent: usize,
    /// Sub-task batch size.
    pub batch_size: usize,
    /// Simultaneously running sub-tasks per task.
    pub max_sub_task_concurrency: usize,
    /// Failed attempts allowed to retry.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Jitter factor in `[0, 1]`.
    pub jitter: f64,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            batch_size: 1000,
            max_sub_task_concurrency: 10,
            max_retries: 3,
            initial_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            jitter: 0.2,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default level when `LATTICE_LOG` is unset.
    pub level: String,
    /// Emit JSON-formatted logs.
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl NodeConfig {
    /// Loads configuration from an optional file with environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(file_path) = path {
            if Path::new(file_path).exists() {
                let contents = std::fs::read_to_string(file_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `LATTICE__*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LATTICE__NODE__NODE_ID") {
            self.node.node_id = val;
        }
        if let Ok(val) = std::env::var("LATTICE__NODE__HTTP_ADDRESS") {
            self.node.http_address = val;
        }
        if let Ok(val) = std::env::var("LATTICE__STORE__DIMENSIONS") {
            if let Ok(v) = val.parse() {
                self.store.dimensions = v;
            }
        }
        if let Ok(val) = std::env::var("LATTICE__STORE__DISTANCE_FUNCTION") {
            self.store.distance_function = val;
        }
        if let Ok(val) = std::env::var("LATTICE__CLUSTER__VIRTUAL_NODES") {
            if let Ok(v) = val.parse() {
                self.cluster.virtual_nodes = v;
            }
        }
        if let Ok(val) = std::env::var("LATTICE__CLUSTER__REPLICATION_FACTOR") {
            if let Ok(v) = val.parse() {
                self.cluster.replication_factor = v;
            }
        }
        if let Ok(val) = std::env::var("LATTICE__CLUSTER__STABILIZATION_WINDOW_SECS") {
            if let Ok(v) = val.parse() {
                self.cluster.stabilization_window_secs = v;
            }
        }
        if let Ok(val) = std::env::var("LATTICE__CLUSTER__LIVENESS_WINDOW_SECS") {
            if let Ok(v) = val.parse() {
                self.cluster.liveness_window_secs = v;
            }
        }
        if let Ok(val) = std::env::var("LATTICE__TRANSFER__MAX_CONCURRENT") {
            if let Ok(v) = val.parse() {
                self.transfer.max_concurrent = v;
            }
        }
        if let Ok(val) = std::env::var("LATTICE__TRANSFER__BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.transfer.batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("LATTICE__LOGGING__LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("LATTICE__LOGGING__JSON") {
            self.logging.json = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.node_id.is_empty() {
            return Err(ConfigError::Invalid("node_id is required".into()));
        }
        if self.store.dimensions == 0 {
            return Err(ConfigError::Invalid(
                "dimensions must be greater than 0".into(),
            ));
        }
        if self.cluster.virtual_nodes == 0 {
            return Err(ConfigError::Invalid(
                "virtual_nodes must be greater than 0".into(),
            ));
        }
        if self.cluster.replication_factor == 0 {
            return Err(ConfigError::Invalid(
                "replication_factor must be at least 1".into(),
            ));
        }
        self.metric()?;
        Ok(())
    }

    /// Parses the configured distance function.
    pub fn metric(&self) -> Result<DistanceMetric, ConfigError> {
        self.store
            .distance_function
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "unsupported distance function: {}",
                    self.store.distance_function
                ))
            })
    }

    /// Store construction parameters.
    pub fn store_config(&self) -> Result<StoreConfig, ConfigError> {
        Ok(StoreConfig {
            node_id: NodeId::new(self.node.node_id.clone()),
            dimensions: self.store.dimensions,
            metric: self.metric()?,
        })
    }

    /// Membership service parameters.
    pub fn membership_config(&self) -> MembershipConfig {
        MembershipConfig {
            stabilization_window: Duration::from_secs(self.cluster.stabilization_window_secs),
            liveness_window: Duration::from_secs(self.cluster.liveness_window_secs),
            ..MembershipConfig::default()
        }
    }

    /// Transfer retry parameters.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.transfer.max_retries,
            initial_backoff: Duration::from_millis(self.transfer.initial_backoff_ms),
            multiplier: self.transfer.backoff_multiplier,
            max_backoff: Duration::from_millis(self.transfer.max_backoff_ms),
            jitter: self.transfer.jitter,
        }
    }

    /// Rebalance planning parameters.
    pub fn rebalance_config(&self) -> RebalanceConfig {
        RebalanceConfig {
            batch_size: self.transfer.batch_size,
            ..RebalanceConfig::default()
        }
    }

    /// Serializes the configuration to TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
