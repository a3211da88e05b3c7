//! Server Context
//!
//! The coordinator takes no global state. Everything it needs from the rest
//! of the server rides in an explicit context passed at construction.

use std::sync::Arc;

use crate::config::PackSyncConfig;
use crate::error::{Error, Result};
use crate::replication::PartitionInfo;
use crate::store::{Partition, PartitionStore};

/// Explicit server context threaded through the coordinator
pub struct ServerContext {
    pub config: PackSyncConfig,
    pub store: Arc<dyn PartitionStore>,
}

impl ServerContext {
    /// Create a context
    pub fn new(config: PackSyncConfig, store: Arc<dyn PartitionStore>) -> Arc<Self> {
        Arc::new(Self { config, store })
    }

    /// Look up a storage partition, failing with NotFound when absent
    pub fn partition(&self, info: &PartitionInfo) -> Result<Arc<dyn Partition>> {
        self.store
            .partition(info)
            .ok_or_else(|| Error::NotFound(format!("partition {info} not found")))
    }
}
