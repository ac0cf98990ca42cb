//! Configuration types for Ember

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main grid node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Unique node identifier
    pub node_id: u64,

    /// Cluster configuration
    pub cluster: ClusterConfig,

    /// Transaction configuration
    pub transaction: TransactionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            cluster: ClusterConfig::default(),
            transaction: TransactionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GridConfig {
    /// Validate the configuration and return every error found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cluster.cluster_name.is_empty() {
            errors.push("cluster.cluster_name must not be empty".to_string());
        }

        if self.cluster.cache_mode == CacheMode::Distributed && self.cluster.num_owners == 0 {
            errors.push("cluster.num_owners must be at least 1 in distributed mode".to_string());
        }

        if self.cluster.virtual_nodes == 0 {
            errors.push("cluster.virtual_nodes must be at least 1".to_string());
        }

        let dd = &self.transaction.deadlock_detection;
        if dd.rollback_pool_size == 0 {
            errors.push(
                "transaction.deadlock_detection.rollback_pool_size must be at least 1".to_string(),
            );
        }

        if dd.enabled && self.transaction.locking_mode == LockingMode::Optimistic {
            errors.push(
                "transaction.deadlock_detection requires pessimistic locking_mode".to_string(),
            );
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            errors.push(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// How data is spread over the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Every member holds every key
    Replicated,
    /// Each key lives on `num_owners` members
    Distributed,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name
    pub cluster_name: String,

    /// Data placement mode
    pub cache_mode: CacheMode,

    /// Number of owners per key in distributed mode
    pub num_owners: usize,

    /// Virtual nodes per member on the consistent hash ring
    pub virtual_nodes: usize,

    /// Timeout for a single remote command
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: "ember".to_string(),
            cache_mode: CacheMode::Replicated,
            num_owners: 2,
            virtual_nodes: 128,
            rpc_timeout: Duration::from_secs(15),
        }
    }
}

/// Locking strategy for transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockingMode {
    Optimistic,
    Pessimistic,
}

/// Transaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Locking strategy
    pub locking_mode: LockingMode,

    /// How long a lock request waits before failing with a lock timeout
    #[serde(with = "humantime_serde")]
    pub lock_acquisition_timeout: Duration,

    /// Distributed deadlock detection
    #[serde(default)]
    pub deadlock_detection: DeadlockDetectionConfig,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            locking_mode: LockingMode::Pessimistic,
            lock_acquisition_timeout: Duration::from_secs(10),
            deadlock_detection: DeadlockDetectionConfig::default(),
        }
    }
}

/// Distributed deadlock detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlockDetectionConfig {
    /// Enable edge-chasing deadlock detection
    pub enabled: bool,

    /// Concurrent blocking rollback-only calls allowed per cache
    #[serde(default = "default_rollback_pool_size")]
    pub rollback_pool_size: usize,

    /// How long a deadlock notify waits for a newer topology before giving up
    #[serde(default = "default_topology_retry_timeout", with = "humantime_serde")]
    pub topology_retry_timeout: Duration,
}

fn default_rollback_pool_size() -> usize {
    1
}

fn default_topology_retry_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for DeadlockDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rollback_pool_size: default_rollback_pool_size(),
            topology_retry_timeout: default_topology_retry_timeout(),
        }
    }
}

impl DeadlockDetectionConfig {
    /// A disabled configuration.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Detection only runs for pessimistic transactions.
    pub fn is_active(&self, txn: &TransactionConfig) -> bool {
        self.enabled && txn.locking_mode == LockingMode::Pessimistic
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,

    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Duration serialization helper
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
