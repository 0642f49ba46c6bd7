//! Stormgr Configuration
//!
//! This module provides configuration structures for the stormgr
//! cluster membership daemon.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster;
use crate::membership::TrackerConfig;
use crate::store::RetryPolicy;

/// Main stormgr configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StormgrConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster membership configuration
    pub cluster: ClusterConfig,

    /// Cluster store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for gossip traffic
    pub bind_address: String,

    /// Data directory for local state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Cluster membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster identifier, the key of the shared record
    pub id: String,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Single probe timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive missed heartbeats before a node is offline
    #[serde(default = "default_suspect_after_misses")]
    pub suspect_after_misses: u32,

    /// Offline time in milliseconds before a node is removed
    #[serde(default = "default_removal_grace_ms")]
    pub removal_grace_ms: u64,

    /// Attempts for each conditional update of the cluster record
    #[serde(default = "default_cas_max_attempts")]
    pub cas_max_attempts: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_cas_backoff_base_ms")]
    pub cas_backoff_base_ms: u64,

    /// Retry delay cap in milliseconds
    #[serde(default = "default_cas_backoff_max_ms")]
    pub cas_backoff_max_ms: u64,

    /// Watch re-subscribe delay in milliseconds
    #[serde(default = "default_watch_retry_ms")]
    pub watch_retry_ms: u64,

    /// Store failures before the node reports NOT_IN_QUORUM
    #[serde(default = "default_store_failure_threshold")]
    pub store_failure_threshold: u32,
}

/// Store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; only useful for single-process clusters
    Memory,
    /// SQLite file shared by co-located daemons
    Sqlite,
}

/// Cluster store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// SQLite file (defaults to <data_dir>/cluster.db)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Watch poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_probe_timeout_ms() -> u64 {
    500
}

fn default_suspect_after_misses() -> u32 {
    3
}

fn default_removal_grace_ms() -> u64 {
    30_000
}

fn default_cas_max_attempts() -> u32 {
    10
}

fn default_cas_backoff_base_ms() -> u64 {
    50
}

fn default_cas_backoff_max_ms() -> u64 {
    2000
}

fn default_watch_retry_ms() -> u64 {
    1000
}

fn default_store_failure_threshold() -> u32 {
    5
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:9080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/stormgr")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl StormgrConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: StormgrConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.cluster.id.is_empty() {
            return Err(crate::Error::Config("cluster.id cannot be empty".into()));
        }

        if self.cluster.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config("cluster.heartbeat_interval_ms must be positive".into()));
        }

        if self.cluster.suspect_after_misses == 0 {
            return Err(crate::Error::Config("cluster.suspect_after_misses must be at least 1".into()));
        }

        if self.cluster.cas_max_attempts == 0 {
            return Err(crate::Error::Config("cluster.cas_max_attempts must be at least 1".into()));
        }

        if self.cluster.cas_backoff_base_ms > self.cluster.cas_backoff_max_ms {
            return Err(crate::Error::Config(
                "cluster.cas_backoff_base_ms exceeds cluster.cas_backoff_max_ms".into(),
            ));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get the shared store file path
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("cluster.db"))
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get store poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.store.poll_interval_ms)
    }

    /// Failure detection settings
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            heartbeat_interval: self.heartbeat_interval(),
            probe_timeout: Duration::from_millis(self.cluster.probe_timeout_ms),
            suspect_after_misses: self.cluster.suspect_after_misses,
            removal_grace: Duration::from_millis(self.cluster.removal_grace_ms),
        }
    }

    /// Conditional write budget
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.cluster.cas_max_attempts,
            base_delay: Duration::from_millis(self.cluster.cas_backoff_base_ms),
            max_delay: Duration::from_millis(self.cluster.cas_backoff_max_ms),
        }
    }

    /// Core manager configuration
    pub fn cluster_config(&self) -> cluster::Config {
        cluster::Config {
            cluster_id: self.cluster.id.clone(),
            node_id: self.node.id.clone(),
            address: self.advertise_address().to_string(),
            tracker: self.tracker_config(),
            retry: self.retry_policy(),
            watch_retry: Duration::from_millis(self.cluster.watch_retry_ms),
            store_failure_threshold: self.cluster.store_failure_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:9010"
advertise_address = "10.0.0.1:9010"
data_dir = "/var/lib/stormgr"

[cluster]
id = "storage-east"
heartbeat_interval_ms = 250
suspect_after_misses = 4

[store]
backend = "sqlite"
path = "/shared/cluster.db"
"#;

        let config = StormgrConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store_path(), PathBuf::from("/shared/cluster.db"));
        assert!(config.api.enabled);

        let core = config.cluster_config();
        assert_eq!(core.cluster_id, "storage-east");
        assert_eq!(core.address, "10.0.0.1:9010");
        assert_eq!(core.tracker.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(core.tracker.suspect_after_misses, 4);
        assert_eq!(core.tracker.removal_grace, Duration::from_secs(30));
        assert_eq!(core.retry.max_attempts, 10);
    }

    #[test]
    fn test_defaults_and_validation() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "127.0.0.1:9010"
data_dir = "/tmp/stormgr"

[cluster]
id = "c1"
"#;
        let config = StormgrConfig::from_str(toml).unwrap();
        assert_eq!(config.advertise_address(), "127.0.0.1:9010");
        assert_eq!(config.store_path(), PathBuf::from("/tmp/stormgr/cluster.db"));
        assert_eq!(config.logging.level, "info");

        let missing_cluster = toml.replace("id = \"c1\"", "id = \"\"");
        assert!(matches!(
            StormgrConfig::from_str(&missing_cluster),
            Err(crate::Error::Config(_))
        ));

        let bad_backend = format!("{}\n[store]\nbackend = \"etcd\"\n", toml);
        assert!(matches!(
            StormgrConfig::from_str(&bad_backend),
            Err(crate::Error::ConfigParse(_))
        ));
    }
}
