//! Bundled Storage Partitions
//!
//! A minimal in-process engine behind the [`Partition`] seam: an in-memory
//! binlog, an in-memory key set, and the durable term info file the
//! replication state machine depends on.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Partition, PartitionStore, ScrubFn};
use crate::binlog::{Binlog, BinlogOffset};
use crate::config::PackSyncConfig;
use crate::error::{Error, Result};
use crate::replication::PartitionInfo;

/// In-process partition with an in-memory binlog and a durable term file
pub struct LocalPartition {
    info: PartitionInfo,
    binlog: Arc<Binlog>,
    data_dir: PathBuf,
    keys: Mutex<BTreeSet<String>>,
    rsync_term: Mutex<Option<u32>>,
    pending_master_offset: Mutex<Option<BinlogOffset>>,
}

impl LocalPartition {
    /// Create a partition rooted at `data_dir/{table}/{partition_id}`
    pub fn new(info: PartitionInfo, data_dir: &Path, binlog_roll_bytes: u64) -> Self {
        let data_dir = data_dir
            .join(&info.table_name)
            .join(info.partition_id.to_string());
        Self {
            info,
            binlog: Arc::new(Binlog::new(binlog_roll_bytes)),
            data_dir,
            keys: Mutex::new(BTreeSet::new()),
            rsync_term: Mutex::new(None),
            pending_master_offset: Mutex::new(None),
        }
    }

    /// The partition identity
    pub fn info(&self) -> &PartitionInfo {
        &self.info
    }

    /// Append a write to the binlog and remember its key
    pub fn apply_write(&self, key: &str, payload: &[u8]) -> BinlogOffset {
        self.keys.lock().insert(key.to_string());
        self.binlog.append(payload)
    }

    /// Mark a received full dump as ready for adoption at `offset`
    pub fn set_pending_master_offset(&self, offset: BinlogOffset) {
        *self.pending_master_offset.lock() = Some(offset);
    }

    /// Keys currently held (test and scrub verification hook)
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().iter().cloned().collect()
    }
}

impl Partition for LocalPartition {
    fn binlog(&self) -> Arc<Binlog> {
        Arc::clone(&self.binlog)
    }

    fn binlog_offset(&self) -> BinlogOffset {
        self.binlog.tip()
    }

    fn master_term(&self) -> Result<u32> {
        let path = self.term_info_file();
        match std::fs::read_to_string(&path) {
            Ok(content) => content.trim().parse::<u32>().map_err(|e| {
                Error::Corruption(format!(
                    "term info file {} is unreadable: {e}",
                    path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn term_info_file(&self) -> PathBuf {
        self.data_dir.join("term_info")
    }

    fn prepare_rsync(&self, master_term: u32) -> bool {
        *self.rsync_term.lock() = Some(master_term);
        true
    }

    fn try_update_master_offset(&self, scrub: Option<ScrubFn<'_>>) -> Result<bool> {
        let offset = match self.pending_master_offset.lock().take() {
            Some(offset) => offset,
            None => return Ok(false),
        };
        if let Some(scrub) = scrub {
            self.keys.lock().retain(|key| !scrub(key));
        }
        tracing::info!("Partition {} adopted master offset {offset}", self.info);
        Ok(true)
    }
}

/// Partition registry built from configuration
pub struct LocalStore {
    partitions: HashMap<PartitionInfo, Arc<LocalPartition>>,
    partition_nums: HashMap<String, u32>,
}

impl LocalStore {
    /// Build all configured partitions under the configured data directory
    pub fn from_config(config: &PackSyncConfig) -> Self {
        let mut partitions = HashMap::new();
        let mut partition_nums = HashMap::new();
        for table in &config.tables {
            let num = if table.partition_num > 0 {
                table.partition_num
            } else {
                table.partition_ids.len() as u32
            };
            partition_nums.insert(table.name.clone(), num);
            for id in &table.partition_ids {
                let info = PartitionInfo::new(&table.name, *id);
                let partition = LocalPartition::new(
                    info.clone(),
                    config.data_dir(),
                    config.replication.binlog_roll_bytes,
                );
                partitions.insert(info, Arc::new(partition));
            }
        }
        Self {
            partitions,
            partition_nums,
        }
    }

    /// Find the concrete local partition (test hook)
    pub fn local_partition(&self, info: &PartitionInfo) -> Option<Arc<LocalPartition>> {
        self.partitions.get(info).cloned()
    }
}

impl PartitionStore for LocalStore {
    fn partition(&self, info: &PartitionInfo) -> Option<Arc<dyn Partition>> {
        self.partitions
            .get(info)
            .map(|p| Arc::clone(p) as Arc<dyn Partition>)
    }

    fn partition_id_for_key(&self, table: &str, key: &str) -> Option<u32> {
        let num = *self.partition_nums.get(table)?;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        Some((hasher.finish() % num as u64) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> PackSyncConfig {
        PackSyncConfig::from_str(&format!(
            r#"
[node]
bind_address = "127.0.0.1:9221"
data_dir = "{}"

[[tables]]
name = "db0"
partition_ids = [0, 1]
"#,
            dir.display()
        ))
        .unwrap()
    }

    #[test]
    fn test_master_term_missing_file() {
        let dir = tempdir().unwrap();
        let partition =
            LocalPartition::new(PartitionInfo::new("db0", 0), dir.path(), 1024);
        assert_eq!(partition.master_term().unwrap(), 0);
    }

    #[test]
    fn test_master_term_roundtrip() {
        let dir = tempdir().unwrap();
        let partition =
            LocalPartition::new(PartitionInfo::new("db0", 0), dir.path(), 1024);

        let path = partition.term_info_file();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "17").unwrap();
        assert_eq!(partition.master_term().unwrap(), 17);

        std::fs::write(&path, "not a number").unwrap();
        assert!(partition.master_term().unwrap_err().is_corruption());
    }

    #[test]
    fn test_adoption_and_scrub() {
        let dir = tempdir().unwrap();
        let partition =
            LocalPartition::new(PartitionInfo::new("db0", 0), dir.path(), 1024);
        partition.apply_write("keep", b"put keep 1");
        partition.apply_write("drop", b"put drop 1");

        // Nothing pending yet
        assert!(!partition.try_update_master_offset(None).unwrap());

        partition.set_pending_master_offset(BinlogOffset::new(4, 0));
        let scrub = |key: &str| key == "drop";
        assert!(partition
            .try_update_master_offset(Some(&scrub))
            .unwrap());
        assert_eq!(partition.keys(), vec!["keep".to_string()]);
    }

    #[test]
    fn test_store_lookup_and_routing() {
        let dir = tempdir().unwrap();
        let store = LocalStore::from_config(&test_config(dir.path()));

        assert!(store.partition(&PartitionInfo::new("db0", 0)).is_some());
        assert!(store.partition(&PartitionInfo::new("db0", 9)).is_none());
        assert!(store.partition(&PartitionInfo::new("nope", 0)).is_none());

        let id = store.partition_id_for_key("db0", "some-key").unwrap();
        assert!(id < 2);
        assert!(store.partition_id_for_key("nope", "some-key").is_none());
    }
}
