//! Replication Coordinator
//!
//! Per-partition master and slave views, the sliding send window, the
//! fan-out write queue, and the replica manager that ties them together
//! and drives the periodic ticks.

mod manager;
mod master;
mod node;
pub mod protocol;
mod reader_pool;
mod slave;
mod task_cache;
mod window;
mod write_queue;

pub use manager::{PartitionRole, ReplicaManager};
pub use master::{BinlogSyncState, SlaveNode, SlaveNodeStatus, SlaveState, SyncMasterPartition};
pub use node::{PartitionInfo, RmNode};
pub use protocol::WriteTask;
pub use reader_pool::BinlogReaderPool;
pub use slave::{ReplState, SyncSlavePartition};
pub use task_cache::{Pooled, TaskCache, TaskOwner};
pub use window::{SyncWinItem, SyncWindow};
pub use write_queue::WriteQueueManager;

/// Emit a keepalive ping to a slave after this long without a send
pub const SEND_KEEPALIVE_TIMEOUT_US: u64 = 2 * 1_000_000;

/// Evict or reset a peer after this long without receiving from it
pub const RECV_KEEPALIVE_TIMEOUT_US: u64 = 20 * 1_000_000;

/// Drain passes per peer per write queue consume
pub const BINLOG_SEND_PACKET_NUM: usize = 40;

/// Maximum tasks per outbound batch
pub const BINLOG_SEND_BATCH_NUM: usize = 100;

/// Maximum payload bytes per outbound batch (receiver framing limit)
pub const MAX_SEND_BATCH_BYTES: usize = 256 * 1024 * 1024;

/// Binlog files kept around beyond what the slowest slave has acked
pub const BINLOG_PURGE_CUSHION: u32 = 10;

/// Wall-clock microseconds since the Unix epoch
pub(crate) fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
