//! Storage Engine Seams
//!
//! The coordinator does not own the key-value engine. It talks to partition
//! objects through the [`Partition`] trait and finds them through a
//! [`PartitionStore`]. The bundled [`LocalPartition`] implementation backs
//! these seams with an in-memory binlog and a durable term file.

mod local;

pub use local::{LocalPartition, LocalStore};

use std::path::PathBuf;
use std::sync::Arc;

use crate::binlog::{Binlog, BinlogOffset};
use crate::error::Result;
use crate::replication::PartitionInfo;

/// Predicate deciding which keys to scrub during full-sync adoption
pub type ScrubFn<'a> = &'a (dyn Fn(&str) -> bool + Sync);

/// One partition of the storage engine, as seen by the coordinator
pub trait Partition: Send + Sync {
    /// The partition's binlog handle
    fn binlog(&self) -> Arc<Binlog>;

    /// Current binlog tip (producer offset)
    fn binlog_offset(&self) -> BinlogOffset;

    /// Read the durable master term; a missing term file reads as 0
    fn master_term(&self) -> Result<u32>;

    /// Path of the durable term info file
    fn term_info_file(&self) -> PathBuf;

    /// Prepare to receive a full state transfer under the given term
    fn prepare_rsync(&self, master_term: u32) -> bool;

    /// Adopt the binlog offset of a completed full dump, optionally
    /// scrubbing keys the partition no longer owns. Returns whether an
    /// offset was adopted.
    fn try_update_master_offset(&self, scrub: Option<ScrubFn<'_>>) -> Result<bool>;
}

/// Lookup of local partitions by identity
pub trait PartitionStore: Send + Sync {
    /// Find a partition by identity
    fn partition(&self, info: &PartitionInfo) -> Option<Arc<dyn Partition>>;

    /// The partition a key of `table` hashes to, if the table is known
    fn partition_id_for_key(&self, table: &str, key: &str) -> Option<u32>;
}
