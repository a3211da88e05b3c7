//! Partition and Replica Identities

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Identity of one partition of one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub table_name: String,
    pub partition_id: u32,
}

impl PartitionInfo {
    /// Create a new partition identity
    pub fn new(table_name: impl Into<String>, partition_id: u32) -> Self {
        Self {
            table_name: table_name.into(),
            partition_id,
        }
    }
}

impl std::fmt::Display for PartitionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}:{})", self.table_name, self.partition_id)
    }
}

/// One remote replica of one partition.
///
/// Identity is the endpoint plus the partition; the session id is handshake
/// state and deliberately excluded from equality and hashing, so a node
/// keyed into a map stays findable across session refreshes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RmNode {
    pub ip: String,
    pub port: u16,
    pub partition: PartitionInfo,
    pub session_id: i32,
}

impl RmNode {
    /// Create a node with a reset session
    pub fn new(ip: impl Into<String>, port: u16, partition: PartitionInfo) -> Self {
        Self {
            ip: ip.into(),
            port,
            partition,
            session_id: 0,
        }
    }

    /// Create a node with an established session
    pub fn with_session(
        ip: impl Into<String>,
        port: u16,
        partition: PartitionInfo,
        session_id: i32,
    ) -> Self {
        Self {
            ip: ip.into(),
            port,
            partition,
            session_id,
        }
    }

    /// The node's `ip:port` address
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl PartialEq for RmNode {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port && self.partition == other.partition
    }
}

impl Eq for RmNode {}

impl Hash for RmNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
        self.partition.hash(state);
    }
}

impl std::fmt::Display for RmNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}:{}", self.partition, self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_ignores_session() {
        let a = RmNode::new("10.0.0.1", 9221, PartitionInfo::new("db0", 1));
        let b = RmNode::with_session("10.0.0.1", 9221, PartitionInfo::new("db0", 1), 42);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_identity_includes_partition() {
        let a = RmNode::new("10.0.0.1", 9221, PartitionInfo::new("db0", 1));
        let b = RmNode::new("10.0.0.1", 9221, PartitionInfo::new("db0", 2));
        assert_ne!(a, b);
    }
}
