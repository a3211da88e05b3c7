//! Master-Side Partition View
//!
//! For a partition acting as master, tracks every remote replica consuming
//! its binlog: lifecycle state, sliding send window, sent and acked
//! offsets, keepalive timestamps, and the pooled binlog reader feeding the
//! outbound write queue.
//!
//! Lock order: the partition's slave-list mutex, then a slave's own mutex.

use parking_lot::Mutex;
use std::sync::Arc;

use super::node::{PartitionInfo, RmNode};
use super::protocol::WriteTask;
use super::reader_pool::BinlogReaderPool;
use super::window::{SyncWinItem, SyncWindow};
use super::write_queue::WriteQueueManager;
use super::{now_micros, BINLOG_PURGE_CUSHION, RECV_KEEPALIVE_TIMEOUT_US, SEND_KEEPALIVE_TIMEOUT_US};
use crate::binlog::{Binlog, BinlogOffset, BinlogReader};
use crate::error::{Error, Result};
use crate::store::Partition;

/// Lifecycle of one remote replica, as the master sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    NotSync,
    DbSync,
    BinlogSync,
}

impl std::fmt::Display for SlaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlaveState::NotSync => "SlaveNotSync",
            SlaveState::DbSync => "SlaveDbSync",
            SlaveState::BinlogSync => "SlaveBinlogSync",
        };
        write!(f, "{s}")
    }
}

/// Where a binlog-syncing replica's records come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinlogSyncState {
    NotSync,
    ReadFromFile,
}

struct SlaveNodeInner {
    slave_state: SlaveState,
    b_state: BinlogSyncState,
    sync_win: SyncWindow,
    sent_offset: BinlogOffset,
    acked_offset: BinlogOffset,
    last_send_us: u64,
    last_recv_us: u64,
    session_id: i32,
    reader: Option<Box<dyn BinlogReader>>,
}

/// Master-side state for one remote replica
pub struct SlaveNode {
    ip: String,
    port: u16,
    partition: PartitionInfo,
    master_term: u32,
    readers: Arc<BinlogReaderPool>,
    inner: Mutex<SlaveNodeInner>,
}

impl SlaveNode {
    fn new(
        ip: String,
        port: u16,
        partition: PartitionInfo,
        session_id: i32,
        master_term: u32,
        window_size: usize,
        readers: Arc<BinlogReaderPool>,
    ) -> Self {
        let now = now_micros();
        Self {
            ip,
            port,
            partition,
            master_term,
            readers,
            inner: Mutex::new(SlaveNodeInner {
                slave_state: SlaveState::NotSync,
                b_state: BinlogSyncState::NotSync,
                sync_win: SyncWindow::new(window_size),
                sent_offset: BinlogOffset::default(),
                acked_offset: BinlogOffset::default(),
                last_send_us: now,
                last_recv_us: now,
                session_id,
                reader: None,
            }),
        }
    }

    /// The replica's ip
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// The replica's port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The partition the replica follows (may differ from the master's own
    /// id while resharding)
    pub fn partition(&self) -> &PartitionInfo {
        &self.partition
    }

    /// The term the replica handed us at handshake; echoed on every push so
    /// the replica can reject stale masters
    pub fn master_term(&self) -> u32 {
        self.master_term
    }

    fn reader_key(&self) -> RmNode {
        RmNode::new(self.ip.clone(), self.port, self.partition.clone())
    }

    fn rm_node(&self, session_id: i32) -> RmNode {
        RmNode::with_session(self.ip.clone(), self.port, self.partition.clone(), session_id)
    }

    fn init_binlog_reader(
        &self,
        inner: &mut SlaveNodeInner,
        binlog: &Arc<Binlog>,
        offset: BinlogOffset,
    ) -> Result<()> {
        let key = self.reader_key();
        let mut reader = self.readers.fetch(&key)?;
        if let Err(e) = reader.seek(binlog, offset) {
            // The reader goes back even though it never attached
            let _ = self.readers.release(&key, reader);
            return Err(Error::Corruption(format!(
                "binlog reader init for {key} failed: {e}"
            )));
        }
        inner.reader = Some(reader);
        Ok(())
    }
}

impl Drop for SlaveNode {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(reader) = inner.reader.take() {
            // NotFound is tolerated when torn down mid-activation
            let _ = self.readers.release(&self.reader_key(), reader);
        }
    }
}

/// Point-in-time view of one replica, for the info surface
#[derive(Debug, Clone)]
pub struct SlaveNodeStatus {
    pub addr: String,
    pub partition_id: u32,
    pub slave_state: SlaveState,
    pub sent_offset: BinlogOffset,
    pub acked_offset: BinlogOffset,
    pub window_len: usize,
}

/// Master view of one local partition
pub struct SyncMasterPartition {
    info: PartitionInfo,
    storage: Arc<dyn Partition>,
    readers: Arc<BinlogReaderPool>,
    queues: Arc<WriteQueueManager>,
    window_size: usize,
    slaves: Mutex<Vec<Arc<SlaveNode>>>,
    session_id: Mutex<i32>,
}

impl SyncMasterPartition {
    /// Create the master view of `info`
    pub fn new(
        info: PartitionInfo,
        storage: Arc<dyn Partition>,
        readers: Arc<BinlogReaderPool>,
        queues: Arc<WriteQueueManager>,
        window_size: usize,
    ) -> Self {
        Self {
            info,
            storage,
            readers,
            queues,
            window_size,
            slaves: Mutex::new(Vec::new()),
            session_id: Mutex::new(1),
        }
    }

    /// The partition identity
    pub fn partition_info(&self) -> &PartitionInfo {
        &self.info
    }

    /// Number of tracked replicas
    pub fn slave_count(&self) -> usize {
        self.slaves.lock().len()
    }

    /// Check whether an endpoint is tracked
    pub fn slave_exists(&self, ip: &str, port: u16) -> bool {
        self.slaves
            .lock()
            .iter()
            .any(|s| s.ip == ip && s.port == port)
    }

    /// The session id handed to an endpoint at handshake
    pub fn slave_session_id(&self, ip: &str, port: u16) -> Result<i32> {
        let slaves = self.slaves.lock();
        let slave = find_slave(&slaves, ip, port)?;
        let session = slave.inner.lock().session_id;
        Ok(session)
    }

    /// Track a replica. Re-adding the same endpoint for the same partition
    /// refreshes its session id; the same endpoint for a different
    /// partition is a protocol corruption.
    pub fn add_slave_node(
        &self,
        ip: &str,
        port: u16,
        partition_id: u32,
        session_id: i32,
        master_term: u32,
    ) -> Result<()> {
        let mut slaves = self.slaves.lock();
        for slave in slaves.iter() {
            if slave.ip == ip && slave.port == port {
                if slave.partition.partition_id == partition_id {
                    slave.inner.lock().session_id = session_id;
                    return Ok(());
                }
                return Err(Error::Corruption(format!(
                    "multiple partitions from one replica endpoint: adding {partition_id} \
                     but {} already tracked for {ip}:{port}",
                    slave.partition.partition_id
                )));
            }
        }

        // While resharding, partition_id may differ from this master's own
        let partition = PartitionInfo::new(&self.info.table_name, partition_id);
        let slave = Arc::new(SlaveNode::new(
            ip.to_string(),
            port,
            partition,
            session_id,
            master_term,
            self.window_size,
            Arc::clone(&self.readers),
        ));
        tracing::info!(
            "Add slave node, partition: {}, endpoint: {ip}:{port}",
            slave.partition
        );
        slaves.push(slave);
        Ok(())
    }

    /// Stop tracking an endpoint
    pub fn remove_slave_node(&self, ip: &str, port: u16) -> Result<()> {
        let mut slaves = self.slaves.lock();
        let before = slaves.len();
        slaves.retain(|s| !(s.ip == ip && s.port == port));
        if slaves.len() == before {
            return Err(Error::NotFound(format!(
                "slave {ip}:{port} not found in {}",
                self.info
            )));
        }
        tracing::info!(
            "Remove slave node, partition: {}, endpoint: {ip}:{port}",
            self.info
        );
        Ok(())
    }

    /// Start binlog streaming to a replica from `offset` and push the first
    /// window of records
    pub fn activate_slave_binlog_sync(
        &self,
        ip: &str,
        port: u16,
        binlog: &Arc<Binlog>,
        offset: BinlogOffset,
    ) -> Result<()> {
        {
            let slaves = self.slaves.lock();
            let slave = find_slave(&slaves, ip, port)?;
            let mut inner = slave.inner.lock();
            inner.slave_state = SlaveState::BinlogSync;
            inner.sent_offset = offset;
            inner.acked_offset = offset;
            inner.sync_win = SyncWindow::new(self.window_size);
            slave.init_binlog_reader(&mut inner, binlog, offset)?;
            inner.b_state = BinlogSyncState::ReadFromFile;
        }
        self.sync_binlog_to_wq(ip, port)
    }

    /// Mark a replica as receiving a full state transfer; the transfer
    /// itself runs out of band
    pub fn activate_slave_db_sync(&self, ip: &str, port: u16) -> Result<()> {
        let slaves = self.slaves.lock();
        let slave = find_slave(&slaves, ip, port)?;
        slave.inner.lock().slave_state = SlaveState::DbSync;
        Ok(())
    }

    /// Fill the targeted replica's free window slots from its reader
    pub fn sync_binlog_to_wq(&self, ip: &str, port: u16) -> Result<()> {
        let slaves = self.slaves.lock();
        let slave = find_slave(&slaves, ip, port)?;
        let mut inner = slave.inner.lock();
        if inner.b_state == BinlogSyncState::ReadFromFile {
            self.read_binlog_file_to_wq(slave, &mut inner)?;
        }
        Ok(())
    }

    fn read_binlog_file_to_wq(
        &self,
        slave: &Arc<SlaveNode>,
        inner: &mut SlaveNodeInner,
    ) -> Result<()> {
        let count = inner.sync_win.remaining();
        let mut tasks = Vec::new();
        for _ in 0..count {
            let chip = {
                let reader = inner.reader.as_mut().ok_or_else(|| {
                    Error::Internal(format!(
                        "slave {}:{} in ReadFromFile without a reader",
                        slave.ip, slave.port
                    ))
                })?;
                match reader.get() {
                    Ok(Some(chip)) => chip,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("{} read binlog error: {e}", self.info);
                        return Err(e);
                    }
                }
            };
            inner.sync_win.push(SyncWinItem::new(chip.offset));
            inner.sent_offset = chip.offset;
            inner.last_send_us = now_micros();
            let target = slave.rm_node(inner.session_id);
            tasks.push(WriteTask::new(target, slave.master_term, chip));
        }

        if !tasks.is_empty() {
            self.queues.produce(&slave.ip, slave.port, tasks);
        }
        Ok(())
    }

    /// Refill every replica that has drained its window
    pub fn wake_up_slave_binlog_sync(&self) -> Result<()> {
        let slaves = self.slaves.lock();
        for slave in slaves.iter() {
            let mut inner = slave.inner.lock();
            if inner.sent_offset == inner.acked_offset
                && inner.b_state == BinlogSyncState::ReadFromFile
            {
                self.read_binlog_file_to_wq(slave, &mut inner)?;
            }
        }
        Ok(())
    }

    /// Apply a replica's ack range to its window
    pub fn update_slave_binlog_ack_info(
        &self,
        ip: &str,
        port: u16,
        start: BinlogOffset,
        end: BinlogOffset,
    ) -> Result<()> {
        let slaves = self.slaves.lock();
        let slave = find_slave(&slaves, ip, port)?;
        let mut inner = slave.inner.lock();
        if inner.slave_state != SlaveState::BinlogSync {
            return Err(Error::Corruption(format!(
                "slave {ip}:{port} acked in state {}",
                inner.slave_state
            )));
        }
        if let Some(new_acked) = inner.sync_win.update(start, end)? {
            inner.acked_offset = new_acked;
        }
        Ok(())
    }

    /// The replica's sent and acked offsets
    pub fn slave_sync_binlog_info(
        &self,
        ip: &str,
        port: u16,
    ) -> Result<(BinlogOffset, BinlogOffset)> {
        let slaves = self.slaves.lock();
        let slave = find_slave(&slaves, ip, port)?;
        let inner = slave.inner.lock();
        Ok((inner.sent_offset, inner.acked_offset))
    }

    /// The replica's lifecycle state
    pub fn slave_state(&self, ip: &str, port: u16) -> Result<SlaveState> {
        let slaves = self.slaves.lock();
        let slave = find_slave(&slaves, ip, port)?;
        let state = slave.inner.lock().slave_state;
        Ok(state)
    }

    /// Stamp the last send time of a replica
    pub fn set_last_send_time(&self, ip: &str, port: u16, time: u64) -> Result<()> {
        let slaves = self.slaves.lock();
        let slave = find_slave(&slaves, ip, port)?;
        slave.inner.lock().last_send_us = time;
        Ok(())
    }

    /// Stamp the last receive time of a replica
    pub fn set_last_recv_time(&self, ip: &str, port: u16, time: u64) -> Result<()> {
        let slaves = self.slaves.lock();
        let slave = find_slave(&slaves, ip, port)?;
        slave.inner.lock().last_recv_us = time;
        Ok(())
    }

    /// The largest binlog file index that may be purged without starving
    /// any replica, or `None` while that cannot be guaranteed
    pub fn safety_purge_binlog(&self) -> Option<u32> {
        let tip = self.storage.binlog_offset();
        let mut purge_max = tip.file_index.checked_sub(BINLOG_PURGE_CUSHION)?;

        let slaves = self.slaves.lock();
        for slave in slaves.iter() {
            let inner = slave.inner.lock();
            if inner.slave_state == SlaveState::BinlogSync && inner.acked_offset.file_index > 0
            {
                purge_max = purge_max.min(inner.acked_offset.file_index - 1);
            } else {
                return None;
            }
        }
        Some(purge_max)
    }

    /// Check whether purging files up to `index` is safe right now
    pub fn binlog_cloud_purge(&self, index: u32) -> bool {
        let tip = self.storage.binlog_offset();
        match tip.file_index.checked_sub(BINLOG_PURGE_CUSHION) {
            Some(max) if index <= max => {}
            _ => return false,
        }

        let slaves = self.slaves.lock();
        for slave in slaves.iter() {
            let inner = slave.inner.lock();
            match inner.slave_state {
                SlaveState::DbSync => return false,
                SlaveState::BinlogSync if index >= inner.acked_offset.file_index => {
                    return false;
                }
                _ => {}
            }
        }
        true
    }

    /// Evict replicas that went silent and ping the ones we went silent on
    pub fn check_sync_timeout(&self, now: u64) -> Result<()> {
        let mut slaves = self.slaves.lock();
        let mut to_del = Vec::new();

        for slave in slaves.iter() {
            let mut inner = slave.inner.lock();
            if inner.last_recv_us + RECV_KEEPALIVE_TIMEOUT_US < now {
                to_del.push((slave.ip.clone(), slave.port));
            } else if inner.last_send_us + SEND_KEEPALIVE_TIMEOUT_US < now {
                let ping = WriteTask::keepalive(slave.rm_node(inner.session_id), slave.master_term);
                self.queues.produce(&slave.ip, slave.port, vec![ping]);
                inner.last_send_us = now;
            }
        }

        // Removals apply after the walk so the traversal stays valid
        for (ip, port) in to_del {
            slaves.retain(|s| !(s.ip == ip && s.port == port));
            tracing::warn!(
                "{} master evicted recv-timeout slave {ip}:{port}",
                self.info
            );
        }
        Ok(())
    }

    /// Hand out the next session id
    pub fn gen_session_id(&self) -> i32 {
        let mut session = self.session_id.lock();
        let id = *session;
        *session += 1;
        id
    }

    /// Check a replica's claimed session id against the stored one
    pub fn check_session_id(
        &self,
        ip: &str,
        port: u16,
        table_name: &str,
        partition_id: u32,
        session_id: i32,
    ) -> bool {
        let slaves = self.slaves.lock();
        let slave = match find_slave(&slaves, ip, port) {
            Ok(slave) => slave,
            Err(_) => {
                tracing::warn!(
                    "Check session id: slave {ip}:{port} not found, {table_name}:{partition_id}"
                );
                return false;
            }
        };
        let stored = slave.inner.lock().session_id;
        if stored != session_id {
            tracing::warn!(
                "Check session id mismatch: {ip}:{port}, {table_name}:{partition_id} \
                 claimed {session_id}, stored {stored}"
            );
            return false;
        }
        true
    }

    /// Addresses of replicas currently in binlog sync
    pub fn valid_slave_addrs(&self) -> Vec<String> {
        self.slaves
            .lock()
            .iter()
            .filter(|s| s.inner.lock().slave_state == SlaveState::BinlogSync)
            .map(|s| format!("{}:{}", s.ip, s.port))
            .collect()
    }

    /// Snapshot every replica for the info surface
    pub fn status(&self) -> Vec<SlaveNodeStatus> {
        self.slaves
            .lock()
            .iter()
            .map(|s| {
                let inner = s.inner.lock();
                SlaveNodeStatus {
                    addr: format!("{}:{}", s.ip, s.port),
                    partition_id: s.partition.partition_id,
                    slave_state: inner.slave_state,
                    sent_offset: inner.sent_offset,
                    acked_offset: inner.acked_offset,
                    window_len: inner.sync_win.len(),
                }
            })
            .collect()
    }
}

fn find_slave<'a>(
    slaves: &'a [Arc<SlaveNode>],
    ip: &str,
    port: u16,
) -> Result<&'a Arc<SlaveNode>> {
    slaves
        .iter()
        .find(|s| s.ip == ip && s.port == port)
        .ok_or_else(|| Error::NotFound(format!("slave {ip}:{port} not found")))
}
