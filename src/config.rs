//! PackSync Configuration
//!
//! Configuration structures for the replication coordinator. Roles are not
//! configured here: every listed partition gets both a master and a slave
//! view, and which one carries traffic depends on what the operator wires
//! up at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main PackSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Tables and their partitions hosted by this node
    #[serde(default)]
    pub tables: Vec<TableConfig>,

    /// Replication tuning
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to bind for replication traffic
    pub bind_address: String,

    /// Data directory for binlogs and term state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// One table and the partition ids this node hosts for it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name
    pub name: String,

    /// Partition ids hosted locally
    pub partition_ids: Vec<u32>,

    /// Total partition count of the table (for key routing)
    #[serde(default)]
    pub partition_num: u32,
}

/// Replication tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Maximum in-flight binlog records per slave
    #[serde(default = "default_sync_window_size")]
    pub sync_window_size: usize,

    /// Preallocated outbound batch buffers (caps fan-out in flight)
    #[serde(default = "default_send_buffer_count")]
    pub send_buffer_count: usize,

    /// Slave state machine tick interval in milliseconds
    #[serde(default = "default_state_machine_interval_ms")]
    pub state_machine_interval_ms: u64,

    /// Keepalive / timeout sweep interval in milliseconds
    #[serde(default = "default_timeout_sweep_interval_ms")]
    pub timeout_sweep_interval_ms: u64,

    /// Write queue drain interval in milliseconds
    #[serde(default = "default_write_queue_interval_ms")]
    pub write_queue_interval_ms: u64,

    /// Minimum spacing between meta sync requests in seconds
    #[serde(default = "default_meta_sync_wait_secs")]
    pub meta_sync_wait_secs: u64,

    /// Binlog file roll size in bytes
    #[serde(default = "default_binlog_roll_bytes")]
    pub binlog_roll_bytes: u64,
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

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/packsync")
}

fn default_sync_window_size() -> usize {
    9000
}

fn default_send_buffer_count() -> usize {
    64
}

fn default_state_machine_interval_ms() -> u64 {
    1000
}

fn default_timeout_sweep_interval_ms() -> u64 {
    1000
}

fn default_write_queue_interval_ms() -> u64 {
    100
}

fn default_meta_sync_wait_secs() -> u64 {
    10
}

fn default_binlog_roll_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            sync_window_size: default_sync_window_size(),
            send_buffer_count: default_send_buffer_count(),
            state_machine_interval_ms: default_state_machine_interval_ms(),
            timeout_sweep_interval_ms: default_timeout_sweep_interval_ms(),
            write_queue_interval_ms: default_write_queue_interval_ms(),
            meta_sync_wait_secs: default_meta_sync_wait_secs(),
            binlog_roll_bytes: default_binlog_roll_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl PackSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: PackSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config(
                "node.bind_address cannot be empty".into(),
            ));
        }

        if self.replication.sync_window_size == 0 {
            return Err(crate::Error::Config(
                "replication.sync_window_size must be positive".into(),
            ));
        }

        for table in &self.tables {
            if table.name.is_empty() {
                return Err(crate::Error::Config("table name cannot be empty".into()));
            }
            if table.partition_ids.is_empty() {
                return Err(crate::Error::Config(format!(
                    "table '{}' has no partitions",
                    table.name
                )));
            }
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the state machine tick interval as Duration
    pub fn state_machine_interval(&self) -> Duration {
        Duration::from_millis(self.replication.state_machine_interval_ms)
    }

    /// Get the timeout sweep interval as Duration
    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.replication.timeout_sweep_interval_ms)
    }

    /// Get the write queue drain interval as Duration
    pub fn write_queue_interval(&self) -> Duration {
        Duration::from_millis(self.replication.write_queue_interval_ms)
    }
}
