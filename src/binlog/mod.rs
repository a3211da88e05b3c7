//! Binlog Types and Access
//!
//! The binlog is the append-only write-ahead log of one partition. Records
//! are addressed by a (file index, byte offset) pair; replication streams
//! records as self-describing chips carrying their read position.

mod log;
mod reader;

pub use log::Binlog;
pub use reader::{BinlogReader, LogReader};

use serde::{Deserialize, Serialize};

/// Pointer into the append-only binlog of one partition.
///
/// Ordering is lexicographic on (file index, byte offset), which matches
/// append order across file rolls.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BinlogOffset {
    pub file_index: u32,
    pub byte_offset: u64,
}

impl BinlogOffset {
    /// Create a new offset
    pub fn new(file_index: u32, byte_offset: u64) -> Self {
        Self {
            file_index,
            byte_offset,
        }
    }
}

impl std::fmt::Display for BinlogOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_index, self.byte_offset)
    }
}

/// One binlog record in flight.
///
/// The offset is the read position after the record, so a slave that applied
/// the chip acknowledges exactly this offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogChip {
    pub offset: BinlogOffset,
    pub payload: Vec<u8>,
}

impl BinlogChip {
    /// Create a new chip
    pub fn new(offset: BinlogOffset, payload: Vec<u8>) -> Self {
        Self { offset, payload }
    }

    /// An empty chip at offset (0, 0), used as a keepalive ping
    pub fn keepalive() -> Self {
        Self {
            offset: BinlogOffset::default(),
            payload: Vec::new(),
        }
    }

    /// Check whether this chip is a keepalive ping
    pub fn is_keepalive(&self) -> bool {
        self.offset == BinlogOffset::default() && self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_ordering() {
        let a = BinlogOffset::new(3, 900);
        let b = BinlogOffset::new(4, 0);
        let c = BinlogOffset::new(4, 100);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, BinlogOffset::new(3, 900));
    }

    #[test]
    fn test_keepalive_chip() {
        assert!(BinlogChip::keepalive().is_keepalive());
        assert!(!BinlogChip::new(BinlogOffset::new(0, 1), vec![]).is_keepalive());
        assert!(!BinlogChip::new(BinlogOffset::default(), vec![1]).is_keepalive());
    }
}
