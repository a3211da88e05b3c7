//! Replication Wire Protocol
//!
//! Defines the messages exchanged between masters and slaves. Requests flow
//! from a slave partition to its master's replication endpoint; binlog
//! chips are pushed back down the same connection.

use serde::{Deserialize, Serialize};

use super::node::{PartitionInfo, RmNode};
use crate::binlog::{BinlogChip, BinlogOffset};

/// One outbound binlog push to one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteTask {
    pub target: RmNode,
    pub master_term: u32,
    pub chip: BinlogChip,
}

impl WriteTask {
    /// Create a task carrying one binlog chip
    pub fn new(target: RmNode, master_term: u32, chip: BinlogChip) -> Self {
        Self {
            target,
            master_term,
            chip,
        }
    }

    /// Create an empty keepalive ping
    pub fn keepalive(target: RmNode, master_term: u32) -> Self {
        Self {
            target,
            master_term,
            chip: BinlogChip::keepalive(),
        }
    }
}

/// Requests sent to a master's replication endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplRequest {
    /// Initial handshake before any partition-level sync
    MetaSync { local_ip: String, port: u16 },

    /// Ask to catch up via binlog from the given offset
    TrySync {
        node: RmNode,
        offset: BinlogOffset,
        local_ip: String,
        master_term: u32,
    },

    /// Ask for a full state transfer
    DbSync {
        node: RmNode,
        offset: BinlogOffset,
        local_ip: String,
        master_term: u32,
    },

    /// Acknowledge a contiguous range of applied binlog chips. The first
    /// ack after a try-sync carries `is_first` and the adopted offset.
    BinlogSync {
        node: RmNode,
        ack_start: BinlogOffset,
        ack_end: BinlogOffset,
        local_ip: String,
        is_first: bool,
    },

    /// Stop following; the master drops this replica
    RemoveSlaveNode {
        node: RmNode,
        local_ip: String,
        master_term: u32,
    },
}

/// Responses and pushes from a master's replication endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplResponse {
    /// Meta sync reply
    MetaSync { ok: bool },

    /// Try-sync verdict with the session to use from now on
    TrySync {
        partition: PartitionInfo,
        session_id: i32,
        reply: TrySyncReply,
    },

    /// Db-sync accepted; the dump proceeds out of band
    DbSync {
        partition: PartitionInfo,
        session_id: i32,
    },

    /// Remove-slave-node reply
    RemoveSlaveNode { ok: bool },

    /// A batch of binlog chips pushed to a slave
    BinlogChips { tasks: Vec<WriteTask> },
}

/// Verdict of a try-sync request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrySyncReply {
    /// The slave's offset is serviceable; catch up via binlog from here
    CatchUp { offset: BinlogOffset },
    /// The slave is too far behind; a full dump is required
    FullSyncNeeded,
}

impl ReplRequest {
    /// Serialize the request to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize a request from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            ReplRequest::MetaSync { .. } => "MetaSync",
            ReplRequest::TrySync { .. } => "TrySync",
            ReplRequest::DbSync { .. } => "DbSync",
            ReplRequest::BinlogSync { .. } => "BinlogSync",
            ReplRequest::RemoveSlaveNode { .. } => "RemoveSlaveNode",
        }
    }
}

impl ReplResponse {
    /// Serialize the response to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize a response from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            ReplResponse::MetaSync { .. } => "MetaSync",
            ReplResponse::TrySync { .. } => "TrySync",
            ReplResponse::DbSync { .. } => "DbSync",
            ReplResponse::RemoveSlaveNode { .. } => "RemoveSlaveNode",
            ReplResponse::BinlogChips { .. } => "BinlogChips",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::node::PartitionInfo;

    #[test]
    fn test_request_serialization() {
        let msg = ReplRequest::TrySync {
            node: RmNode::new("10.0.0.2", 9221, PartitionInfo::new("db0", 3)),
            offset: BinlogOffset::new(5, 1000),
            local_ip: "10.0.0.9".to_string(),
            master_term: 7,
        };

        let bytes = msg.serialize().unwrap();
        let restored = ReplRequest::deserialize(&bytes).unwrap();

        match restored {
            ReplRequest::TrySync {
                node,
                offset,
                master_term,
                ..
            } => {
                assert_eq!(node.partition.partition_id, 3);
                assert_eq!(offset, BinlogOffset::new(5, 1000));
                assert_eq!(master_term, 7);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_chips_serialization() {
        let target = RmNode::with_session("10.0.0.2", 9221, PartitionInfo::new("db0", 0), 4);
        let msg = ReplResponse::BinlogChips {
            tasks: vec![
                WriteTask::new(
                    target.clone(),
                    2,
                    BinlogChip::new(BinlogOffset::new(0, 12), b"put k v".to_vec()),
                ),
                WriteTask::keepalive(target, 2),
            ],
        };

        let bytes = msg.serialize().unwrap();
        match ReplResponse::deserialize(&bytes).unwrap() {
            ReplResponse::BinlogChips { tasks } => {
                assert_eq!(tasks.len(), 2);
                assert!(tasks[1].chip.is_keepalive());
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"binlog chip payload";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }
}
