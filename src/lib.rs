//! PackSync - Replication Coordinator for a Sharded Key-Value Store
//!
//! PackSync keeps the partitions of a sharded, partitioned key-value server
//! in sync. Every local partition carries two mirrored views: a master view
//! that streams the partition's binlog to remote replicas through a sliding
//! send window, and a slave view that follows a remote master through a
//! term-guarded replication state machine.
//!
//! # Architecture
//!
//! Roles are configured, not elected. A master partition tracks each remote
//! replica's sent and acknowledged binlog offsets and pushes more records as
//! acks free window slots; a slave partition walks a lifecycle state machine
//! (try-sync, full dump, binlog catch-up) whose every transition is a
//! compare-and-swap guarded by the current master term. The term is bumped
//! and persisted on every master change, so requests issued under stale
//! authority are rejected.
//!
//! # Features
//!
//! - Sliding-window binlog streaming with per-replica flow control
//! - Out-of-order ack reconciliation with contiguous-prefix advance
//! - Fan-out write queue batching binlog chips to many peers
//! - Keepalive-based liveness detection on both roles
//! - Session-id handshakes guarding against replayed connections
//! - Pooled binlog readers with at-most-one checkout per replica

pub mod binlog;
pub mod config;
pub mod context;
pub mod error;
pub mod network;
pub mod replication;
pub mod store;

pub use config::PackSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::binlog::{Binlog, BinlogChip, BinlogOffset, BinlogReader};
    pub use crate::config::PackSyncConfig;
    pub use crate::context::ServerContext;
    pub use crate::error::{Error, Result};
    pub use crate::replication::{
        PartitionInfo, ReplState, ReplicaManager, RmNode, WriteTask,
    };
    pub use crate::store::{Partition, PartitionStore};
}
