//! Replica Manager
//!
//! The top-level registry mapping partition identity to its master and
//! slave views. Dispatches RPCs through the client and server seams,
//! drives the slave state machine, sweeps keepalive timeouts, and pumps
//! the fan-out write queue.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::master::{SlaveState, SyncMasterPartition};
use super::node::{PartitionInfo, RmNode};
use super::protocol::{ReplRequest, ReplResponse, TrySyncReply, WriteTask};
use super::reader_pool::BinlogReaderPool;
use super::slave::{ReplState, SyncSlavePartition};
use super::write_queue::WriteQueueManager;
use super::now_micros;
use crate::binlog::{BinlogOffset, LogReader};
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::network::{ReplClient, ReplServer, RequestHandler, ResponseHandler};
use crate::store::Partition;

/// The roles a partition currently plays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionRole {
    pub master: bool,
    pub slave: bool,
}

struct PartitionMaps {
    masters: HashMap<PartitionInfo, Arc<SyncMasterPartition>>,
    slaves: HashMap<PartitionInfo, Arc<SyncSlavePartition>>,
}

/// Top-level replication coordinator
pub struct ReplicaManager {
    context: Arc<ServerContext>,
    partitions: RwLock<PartitionMaps>,
    write_queues: Arc<WriteQueueManager>,
    readers: Arc<BinlogReaderPool>,
    client: Arc<dyn ReplClient>,
    server: Arc<dyn ReplServer>,
    last_meta_sync_secs: Mutex<u64>,
    state_machine_nudge: Notify,
    shutdown: AtomicBool,
}

impl ReplicaManager {
    /// Build the coordinator over the configured partitions
    pub fn new(
        context: Arc<ServerContext>,
        client: Arc<dyn ReplClient>,
        server: Arc<dyn ReplServer>,
    ) -> Result<Arc<Self>> {
        let readers = Arc::new(BinlogReaderPool::new(|| Box::new(LogReader::new())));
        let write_queues = Arc::new(WriteQueueManager::new(
            context.config.replication.send_buffer_count,
        ));
        let window_size = context.config.replication.sync_window_size;

        let mut masters = HashMap::new();
        let mut slaves = HashMap::new();
        for table in &context.config.tables {
            for id in &table.partition_ids {
                let info = PartitionInfo::new(&table.name, *id);
                let storage = context.partition(&info)?;
                masters.insert(
                    info.clone(),
                    Arc::new(SyncMasterPartition::new(
                        info.clone(),
                        Arc::clone(&storage),
                        Arc::clone(&readers),
                        Arc::clone(&write_queues),
                        window_size,
                    )),
                );
                slaves.insert(
                    info.clone(),
                    Arc::new(SyncSlavePartition::new(info, storage.term_info_file())),
                );
            }
        }

        Ok(Arc::new(Self {
            context,
            partitions: RwLock::new(PartitionMaps { masters, slaves }),
            write_queues,
            readers,
            client,
            server,
            last_meta_sync_secs: Mutex::new(0),
            state_machine_nudge: Notify::new(),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Load every slave partition's durable master term
    pub fn init_master_terms(&self) -> Result<()> {
        let partitions = self.partitions.read();
        for (info, slave) in &partitions.slaves {
            let storage = self.context.partition(info)?;
            slave.init_master_term(storage.as_ref())?;
        }
        Ok(())
    }

    /// Run the periodic ticks until [`stop`](Self::stop)
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let mut state_machine = tokio::time::interval(self.context.config.state_machine_interval());
        let mut timeout_sweep = tokio::time::interval(self.context.config.timeout_sweep_interval());
        let mut write_queue = tokio::time::interval(self.context.config.write_queue_interval());

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::select! {
                _ = state_machine.tick() => {
                    if let Err(e) = self.run_sync_slave_partition_state_machine().await {
                        tracing::warn!("State machine tick failed: {e}");
                    }
                }
                _ = self.state_machine_nudge.notified() => {
                    if let Err(e) = self.run_sync_slave_partition_state_machine().await {
                        tracing::warn!("State machine tick failed: {e}");
                    }
                }
                _ = timeout_sweep.tick() => {
                    if let Err(e) = self.check_sync_timeout(now_micros()) {
                        tracing::warn!("Timeout sweep failed: {e}");
                    }
                    if let Err(e) = self.wake_up_binlog_sync() {
                        tracing::warn!("Binlog wakeup failed: {e}");
                    }
                }
                _ = write_queue.tick() => {
                    self.consume_write_queue().await;
                }
            }
        }
    }

    /// Ask the tick loop to exit
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.state_machine_nudge.notify_waiters();
    }

    fn master_partition(&self, info: &PartitionInfo) -> Result<Arc<SyncMasterPartition>> {
        self.partitions
            .read()
            .masters
            .get(info)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("sync master partition {info} not found")))
    }

    fn slave_partition(&self, info: &PartitionInfo) -> Result<Arc<SyncSlavePartition>> {
        self.partitions
            .read()
            .slaves
            .get(info)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("sync slave partition {info} not found")))
    }

    /// The master view of a partition, if registered
    pub fn sync_master_partition(&self, info: &PartitionInfo) -> Option<Arc<SyncMasterPartition>> {
        self.partitions.read().masters.get(info).cloned()
    }

    /// The slave view of a partition, if registered
    pub fn sync_slave_partition(&self, info: &PartitionInfo) -> Option<Arc<SyncSlavePartition>> {
        self.partitions.read().slaves.get(info).cloned()
    }

    // ---- write queue ----

    /// Queue tasks for a peer
    pub fn produce_write_queue(&self, ip: &str, port: u16, tasks: Vec<WriteTask>) {
        self.write_queues.produce(ip, port, tasks);
    }

    /// Drain queued batches to their peers; returns tasks dispatched
    pub async fn consume_write_queue(&self) -> usize {
        self.write_queues.consume(self.server.as_ref()).await
    }

    /// Erase a peer's queue
    pub fn drop_write_queue(&self, ip: &str, port: u16) {
        self.write_queues.drop_queue(ip, port);
    }

    // ---- master-side operations ----

    /// Apply a replica's ack and refill its window
    pub fn update_sync_binlog_status(
        &self,
        slave: &RmNode,
        range_start: BinlogOffset,
        range_end: BinlogOffset,
    ) -> Result<()> {
        let partition = self.master_partition(&slave.partition)?;
        partition.update_slave_binlog_ack_info(&slave.ip, slave.port, range_start, range_end)?;
        partition.sync_binlog_to_wq(&slave.ip, slave.port)
    }

    /// A replica's sent and acked offsets
    pub fn get_sync_binlog_status(&self, slave: &RmNode) -> Result<(BinlogOffset, BinlogOffset)> {
        self.master_partition(&slave.partition)?
            .slave_sync_binlog_info(&slave.ip, slave.port)
    }

    /// A replica's master-side lifecycle state
    pub fn get_slave_state(&self, slave: &RmNode) -> Result<SlaveState> {
        self.master_partition(&slave.partition)?
            .slave_state(&slave.ip, slave.port)
    }

    /// Track a replica, replacing any stale entry for the same endpoint
    pub fn add_partition_slave(&self, slave: &RmNode, master_term: u32) -> Result<()> {
        let partition = self.master_partition(&slave.partition)?;
        match partition.remove_slave_node(&slave.ip, slave.port) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        partition.add_slave_node(
            &slave.ip,
            slave.port,
            slave.partition.partition_id,
            slave.session_id,
            master_term,
        )
    }

    /// Stop tracking a replica
    pub fn remove_partition_slave(&self, slave: &RmNode) -> Result<()> {
        self.master_partition(&slave.partition)?
            .remove_slave_node(&slave.ip, slave.port)
    }

    /// Check whether a replica is tracked
    pub fn check_partition_slave_exist(&self, slave: &RmNode) -> bool {
        match self.master_partition(&slave.partition) {
            Ok(partition) => partition.slave_exists(&slave.ip, slave.port),
            Err(_) => false,
        }
    }

    /// The session granted to a replica
    pub fn get_partition_slave_session(&self, slave: &RmNode) -> Result<i32> {
        self.master_partition(&slave.partition)?
            .slave_session_id(&slave.ip, slave.port)
    }

    /// Start binlog streaming to a replica from `offset`
    pub fn activate_binlog_sync(&self, slave: &RmNode, offset: BinlogOffset) -> Result<()> {
        let partition = self.master_partition(&slave.partition)?;
        let storage = self.context.partition(&slave.partition)?;
        partition.activate_slave_binlog_sync(&slave.ip, slave.port, &storage.binlog(), offset)
    }

    /// Mark a replica as receiving a full state transfer
    pub fn activate_db_sync(&self, slave: &RmNode) -> Result<()> {
        self.master_partition(&slave.partition)?
            .activate_slave_db_sync(&slave.ip, slave.port)
    }

    /// Stamp the master-side receive time for a replica
    pub fn set_master_last_recv_time(&self, node: &RmNode, time: u64) -> Result<()> {
        self.master_partition(&node.partition)?
            .set_last_recv_time(&node.ip, node.port, time)
    }

    /// Stamp the slave-side receive time for a partition
    pub fn set_slave_last_recv_time(&self, node: &RmNode, time: u64) -> Result<()> {
        let partition = self.slave_partition(&node.partition)?;
        partition.set_last_recv_time(time);
        Ok(())
    }

    /// Refill every drained window of every master partition
    pub fn wake_up_binlog_sync(&self) -> Result<()> {
        let partitions = self.partitions.read();
        for partition in partitions.masters.values() {
            partition.wake_up_slave_binlog_sync()?;
        }
        Ok(())
    }

    /// Drop an endpoint everywhere: as a replica of every master partition
    /// and as the master of every slave partition
    pub fn lost_connection(&self, ip: &str, port: u16) -> Result<()> {
        let partitions = self.partitions.read();
        for partition in partitions.masters.values() {
            match partition.remove_slave_node(ip, port) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!("Lost connection cleanup failed: {e}"),
            }
        }
        for partition in partitions.slaves.values() {
            if partition.master_ip() == ip && partition.master_port() == port {
                partition.deactivate();
            }
        }
        Ok(())
    }

    // ---- session ids ----

    /// Hand out the next session id of a master partition
    pub fn gen_partition_session_id(&self, table_name: &str, partition_id: u32) -> Option<i32> {
        let info = PartitionInfo::new(table_name, partition_id);
        self.sync_master_partition(&info).map(|p| p.gen_session_id())
    }

    /// The session a slave partition holds towards its master
    pub fn get_slave_partition_session_id(
        &self,
        table_name: &str,
        partition_id: u32,
    ) -> Option<i32> {
        let info = PartitionInfo::new(table_name, partition_id);
        self.sync_slave_partition(&info).map(|p| p.master_session_id())
    }

    /// Check a claimed session id against a slave partition's
    pub fn check_slave_partition_session_id(
        &self,
        table_name: &str,
        partition_id: u32,
        session_id: i32,
    ) -> bool {
        let info = PartitionInfo::new(table_name, partition_id);
        match self.sync_slave_partition(&info) {
            Some(partition) => {
                let stored = partition.master_session_id();
                if stored != session_id {
                    tracing::warn!(
                        "Check session id mismatch: {}:{} {info} claimed {session_id}, stored {stored}",
                        partition.master_ip(),
                        partition.master_port()
                    );
                    return false;
                }
                true
            }
            None => {
                tracing::warn!("Slave partition not found: {info}");
                false
            }
        }
    }

    /// Check a claimed session id against a master partition's replica
    pub fn check_master_partition_session_id(
        &self,
        ip: &str,
        port: u16,
        table_name: &str,
        partition_id: u32,
        session_id: i32,
    ) -> bool {
        let info = PartitionInfo::new(table_name, partition_id);
        match self.sync_master_partition(&info) {
            Some(partition) => {
                partition.check_session_id(ip, port, table_name, partition_id, session_id)
            }
            None => false,
        }
    }

    // ---- slave-side operations ----

    /// Start following a master: probe the local ip the master will see,
    /// bump the term, and enter `repl_state`
    pub async fn activate_sync_slave_partition(
        &self,
        node: &RmNode,
        repl_state: ReplState,
        resharding: bool,
    ) -> Result<()> {
        let partition = self.slave_partition(&node.partition)?;
        let state = partition.state();
        if state != ReplState::NoConnect && state != ReplState::DbNoConnect {
            return Err(Error::Corruption(format!(
                "sync slave partition in {state}"
            )));
        }
        // The storage partition must exist before we commit to following
        self.context.partition(&node.partition)?;

        let local_ip = self.select_local_ip(&node.ip, node.port).await?;
        partition.activate(node.clone(), repl_state)?;
        partition.set_local_ip(local_ip);
        partition.set_resharding(resharding);
        Ok(())
    }

    /// Adopt the session granted by the master
    pub fn update_sync_slave_partition_session_id(
        &self,
        info: &PartitionInfo,
        session_id: i32,
    ) -> Result<()> {
        self.slave_partition(info)?.set_master_session_id(session_id);
        Ok(())
    }

    /// Stop following a master
    pub fn deactivate_sync_slave_partition(&self, info: &PartitionInfo) -> Result<()> {
        self.slave_partition(info)?.deactivate();
        Ok(())
    }

    /// Force a slave partition's state (operator paths)
    pub fn set_slave_repl_state(&self, info: &PartitionInfo, repl_state: ReplState) -> Result<()> {
        self.slave_partition(info)?.set_repl_state(repl_state);
        Ok(())
    }

    /// Term-guarded CAS on a slave partition's state
    pub fn cas_slave_repl_state(
        &self,
        info: &PartitionInfo,
        current_state: ReplState,
        current_term: u32,
        new_state: ReplState,
        reason: &str,
    ) -> Result<()> {
        self.slave_partition(info)?
            .cas_repl_state(current_state, current_term, new_state, reason)
    }

    /// A slave partition's current state
    pub fn get_slave_repl_state(&self, info: &PartitionInfo) -> Result<ReplState> {
        Ok(self.slave_partition(info)?.state())
    }

    /// Check that no slave partition was explicitly unfollowed; such a
    /// partition blocks automatic reconnects
    pub fn check_slave_db_connect(&self) -> bool {
        let partitions = self.partitions.read();
        for partition in partitions.slaves.values() {
            if partition.state() == ReplState::DbNoConnect {
                tracing::info!(
                    "Partition {} was unfollowed explicitly, no reconnect",
                    partition.partition_info()
                );
                return false;
            }
        }
        true
    }

    // ---- outbound requests ----

    /// Rate-limited meta sync handshake towards a master endpoint
    pub async fn send_meta_sync_request(&self, ip: &str, port: u16) -> Result<()> {
        let now_secs = now_micros() / 1_000_000;
        {
            let last = self.last_meta_sync_secs.lock();
            if now_secs.saturating_sub(*last) < self.context.config.replication.meta_sync_wait_secs
            {
                return Ok(());
            }
        }
        self.client.send_meta_sync(ip, port).await?;
        *self.last_meta_sync_secs.lock() = now_secs;
        Ok(())
    }

    /// Ask this partition's master to drop us, then stop reconnecting
    pub async fn send_remove_slave_node_request(
        &self,
        table_name: &str,
        partition_id: u32,
    ) -> Result<()> {
        let info = PartitionInfo::new(table_name, partition_id);
        let partition = self.slave_partition(&info)?;
        let result = self
            .client
            .send_remove_slave_node(
                &partition.master_ip(),
                partition.master_port(),
                table_name,
                partition_id,
                &partition.local_ip(),
                partition.master_term(),
            )
            .await;
        match result {
            Ok(()) => {
                partition.set_repl_state(ReplState::DbNoConnect);
                tracing::info!("Slave partition {info} stopped syncing");
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Slave partition {info} failed to stop syncing: {e}");
                Err(e)
            }
        }
    }

    /// Send a try-sync for one partition and advance its state machine
    pub async fn send_partition_try_sync_request(
        &self,
        table_name: &str,
        partition_id: u32,
    ) -> Result<()> {
        let info = PartitionInfo::new(table_name, partition_id);
        let storage = self.context.partition(&info)?;
        let offset = storage.binlog_offset();
        let partition = self.slave_partition(&info)?;
        let master_term = partition.master_term();

        let result = self
            .client
            .send_partition_try_sync(
                &partition.master_ip(),
                partition.master_port(),
                table_name,
                partition_id,
                offset,
                &partition.local_ip(),
                master_term,
            )
            .await;
        match result {
            Ok(()) => self.cas_slave_repl_state(
                &info,
                ReplState::TryConnect,
                master_term,
                ReplState::WaitReply,
                "try sync sent",
            ),
            Err(e) => {
                let _ = self.cas_slave_repl_state(
                    &info,
                    ReplState::TryConnect,
                    master_term,
                    ReplState::Error,
                    &format!("try sync send failed: {e}"),
                );
                Err(e)
            }
        }
    }

    /// Send a db-sync for one partition and advance its state machine
    pub async fn send_partition_db_sync_request(
        &self,
        table_name: &str,
        partition_id: u32,
    ) -> Result<()> {
        let info = PartitionInfo::new(table_name, partition_id);
        let storage = self.context.partition(&info)?;
        let offset = storage.binlog_offset();
        let partition = self.slave_partition(&info)?;
        let master_term = partition.master_term();

        if !storage.prepare_rsync(master_term) {
            let reason = format!("prepare rsync {info} failed");
            let _ = self.cas_slave_repl_state(
                &info,
                ReplState::TryDbSync,
                master_term,
                ReplState::Error,
                &reason,
            );
            return Err(Error::Corruption(reason));
        }
        if master_term != partition.master_term() {
            return Err(Error::Corruption("master term changed".into()));
        }

        let result = self
            .client
            .send_partition_db_sync(
                &partition.master_ip(),
                partition.master_port(),
                table_name,
                partition_id,
                offset,
                &partition.local_ip(),
                master_term,
            )
            .await;
        match result {
            Ok(()) => self.cas_slave_repl_state(
                &info,
                ReplState::TryDbSync,
                master_term,
                ReplState::WaitReply,
                "db sync sent",
            ),
            Err(e) => {
                let _ = self.cas_slave_repl_state(
                    &info,
                    ReplState::TryDbSync,
                    master_term,
                    ReplState::Error,
                    &format!("db sync send failed: {e}"),
                );
                Err(e)
            }
        }
    }

    /// Ack a range of applied binlog chips to the master
    pub async fn send_partition_binlog_sync_ack_request(
        &self,
        table_name: &str,
        partition_id: u32,
        ack_start: BinlogOffset,
        ack_end: BinlogOffset,
        is_first: bool,
    ) -> Result<()> {
        let info = PartitionInfo::new(table_name, partition_id);
        let partition = self.slave_partition(&info)?;
        self.client
            .send_partition_binlog_sync(
                &partition.master_ip(),
                partition.master_port(),
                table_name,
                partition_id,
                partition.master_session_id(),
                ack_start,
                ack_end,
                &partition.local_ip(),
                is_first,
            )
            .await
    }

    /// Tear down the client connection to a peer
    pub async fn close_repl_client_conn(&self, ip: &str, port: u16) -> Result<()> {
        self.client.close(ip, port).await
    }

    /// Push a batch of chips directly, bypassing the queue
    pub async fn send_slave_binlog_chips_request(
        &self,
        ip: &str,
        port: u16,
        tasks: &[WriteTask],
    ) -> Result<()> {
        self.server.send_slave_binlog_chips(ip, port, tasks).await
    }

    // ---- periodic ticks ----

    /// Drive every slave partition one step along its lifecycle
    pub async fn run_sync_slave_partition_state_machine(&self) -> Result<()> {
        let snapshot: Vec<(PartitionInfo, ReplState)> = {
            let partitions = self.partitions.read();
            partitions
                .slaves
                .iter()
                .map(|(info, p)| (info.clone(), p.state()))
                .collect()
        };

        for (info, state) in snapshot {
            match state {
                ReplState::TryConnect => {
                    let _ = self
                        .send_partition_try_sync_request(&info.table_name, info.partition_id)
                        .await;
                }
                ReplState::TryDbSync => {
                    let _ = self
                        .send_partition_db_sync_request(&info.table_name, info.partition_id)
                        .await;
                }
                ReplState::WaitDbSync => {
                    self.try_adopt_full_sync(&info);
                }
                ReplState::WaitReply
                | ReplState::Connected
                | ReplState::NoConnect
                | ReplState::Error
                | ReplState::DbNoConnect => {}
            }
        }
        Ok(())
    }

    /// Adopt a completed full dump, scrubbing foreign keys when resharding
    fn try_adopt_full_sync(&self, info: &PartitionInfo) {
        let storage = match self.context.partition(info) {
            Ok(storage) => storage,
            Err(_) => {
                tracing::warn!("Partition not found: {info}");
                return;
            }
        };
        let partition = match self.slave_partition(info) {
            Ok(partition) => partition,
            Err(_) => return,
        };

        let adopted = if partition.resharding() {
            let store = Arc::clone(&self.context.store);
            let table = info.table_name.clone();
            let own_id = info.partition_id;
            let scrub = move |key: &str| store.partition_id_for_key(&table, key) != Some(own_id);
            storage.try_update_master_offset(Some(&scrub))
        } else {
            storage.try_update_master_offset(None)
        };

        match adopted {
            Ok(true) => {
                let _ = partition.cas_repl_state(
                    ReplState::WaitDbSync,
                    partition.master_term(),
                    ReplState::Connected,
                    "full sync offset adopted",
                );
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("Adopting full sync offset for {info} failed: {e}"),
        }
    }

    /// Sweep keepalive windows on every partition
    pub fn check_sync_timeout(&self, now: u64) -> Result<()> {
        let partitions = self.partitions.read();
        for partition in partitions.masters.values() {
            if let Err(e) = partition.check_sync_timeout(now) {
                tracing::warn!("Master timeout sweep failed: {e}");
            }
        }
        for partition in partitions.slaves.values() {
            if partition.check_sync_timeout(now) {
                // A reset partition wants its try-sync sent promptly
                self.state_machine_nudge.notify_one();
            }
        }
        Ok(())
    }

    // ---- partition add/remove ----

    fn add_sync_partitions_sanity_check(&self, infos: &[PartitionInfo]) -> Result<()> {
        let partitions = self.partitions.read();
        for info in infos {
            if partitions.masters.contains_key(info) || partitions.slaves.contains_key(info) {
                return Err(Error::Corruption(format!("sync partition {info} exists")));
            }
        }
        Ok(())
    }

    /// Register master and slave views for new partitions
    pub fn add_sync_partitions(&self, infos: &[PartitionInfo]) -> Result<()> {
        self.add_sync_partitions_sanity_check(infos)?;

        let window_size = self.context.config.replication.sync_window_size;
        let mut partitions = self.partitions.write();
        for info in infos {
            let storage = self.context.partition(info)?;
            let slave = Arc::new(SyncSlavePartition::new(
                info.clone(),
                storage.term_info_file(),
            ));
            slave.init_master_term(storage.as_ref())?;
            partitions.masters.insert(
                info.clone(),
                Arc::new(SyncMasterPartition::new(
                    info.clone(),
                    storage,
                    Arc::clone(&self.readers),
                    Arc::clone(&self.write_queues),
                    window_size,
                )),
            );
            partitions.slaves.insert(info.clone(), slave);
        }
        Ok(())
    }

    fn remove_sync_partitions_sanity_check(&self, infos: &[PartitionInfo]) -> Result<()> {
        let partitions = self.partitions.read();
        for info in infos {
            let master = partitions
                .masters
                .get(info)
                .ok_or_else(|| Error::Corruption(format!("sync partition {info} not found")))?;
            let slave = partitions
                .slaves
                .get(info)
                .ok_or_else(|| Error::Corruption(format!("sync partition {info} not found")))?;

            if master.slave_count() != 0 {
                return Err(Error::Corruption(format!(
                    "sync master partition {info} in syncing"
                )));
            }
            let state = slave.state();
            if state != ReplState::NoConnect && state != ReplState::Error {
                return Err(Error::Corruption(format!(
                    "sync slave partition {info} in {state} state"
                )));
            }
        }
        Ok(())
    }

    /// Unregister partitions that are fully idle
    pub fn remove_sync_partitions(&self, infos: &[PartitionInfo]) -> Result<()> {
        self.remove_sync_partitions_sanity_check(infos)?;

        let mut partitions = self.partitions.write();
        for info in infos {
            partitions.masters.remove(info);
            partitions.slaves.remove(info);
        }
        Ok(())
    }

    /// The largest safely purgeable binlog file of a master partition
    pub fn get_safety_purge_binlog(
        &self,
        table_name: &str,
        partition_id: u32,
    ) -> Result<Option<u32>> {
        let info = PartitionInfo::new(table_name, partition_id);
        Ok(self.master_partition(&info)?.safety_purge_binlog())
    }

    /// Check whether purging a master partition's files up to `index` is
    /// safe right now
    pub fn binlog_cloud_purge(&self, table_name: &str, partition_id: u32, index: u32) -> bool {
        let info = PartitionInfo::new(table_name, partition_id);
        match self.sync_master_partition(&info) {
            Some(partition) => partition.binlog_cloud_purge(index),
            None => {
                tracing::warn!("Sync master partition not found: {info}");
                false
            }
        }
    }

    // ---- cluster queries ----

    /// The roles a partition currently plays
    pub fn partition_role(&self, table_name: &str, partition_id: u32) -> Result<PartitionRole> {
        let info = PartitionInfo::new(table_name, partition_id);
        let master = self.master_partition(&info)?;
        let slave = self.slave_partition(&info)?;
        Ok(PartitionRole {
            master: master.slave_count() != 0,
            slave: slave.state() == ReplState::Connected,
        })
    }

    /// Replica addresses that binlog-sync every master partition
    pub fn find_complete_replica(&self) -> Vec<String> {
        let partitions = self.partitions.read();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for partition in partitions.masters.values() {
            for addr in partition.valid_slave_addrs() {
                *counts.entry(addr).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n == partitions.masters.len())
            .map(|(addr, _)| addr)
            .collect()
    }

    /// The single master every slave partition follows, if all are
    /// connected to the same one
    pub fn find_common_master(&self) -> Option<String> {
        let partitions = self.partitions.read();
        let mut common: Option<String> = None;
        for partition in partitions.slaves.values() {
            if partition.state() != ReplState::Connected {
                return None;
            }
            let addr = partition.master_addr();
            match &common {
                None => common = Some(addr),
                Some(seen) if *seen != addr => return None,
                Some(_) => {}
            }
        }
        common
    }

    /// Probe which local ip routes to a remote endpoint
    pub async fn select_local_ip(&self, remote_ip: &str, remote_port: u16) -> Result<String> {
        let addr = format!("{remote_ip}:{remote_port}");
        let stream = tokio::time::timeout(
            Duration::from_millis(1500),
            tokio::net::TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| Error::ConnectionTimeout(addr.clone()))?
        .map_err(|e| Error::ConnectionFailed {
            address: addr,
            reason: e.to_string(),
        })?;
        let local_ip = stream.local_addr()?.ip().to_string();
        Ok(local_ip)
    }

    // ---- scheduling passthroughs ----

    /// Queue received chips for application to the local partition
    pub fn schedule_write_binlog_task(&self, partition_key: &str, tasks: Vec<WriteTask>) {
        self.client.schedule_write_binlog_task(partition_key, tasks);
    }

    /// Queue one parsed write for the local storage engine
    pub fn schedule_write_db_task(
        &self,
        dispatch_key: &str,
        chip: crate::binlog::BinlogChip,
        table_name: &str,
        partition_id: u32,
    ) {
        self.client
            .schedule_write_db_task(dispatch_key, chip, table_name, partition_id);
    }

    /// Drop a server-side client connection
    pub fn repl_server_remove_client_conn(&self, conn_id: u64) {
        self.server.remove_client_conn(conn_id);
    }

    /// Bind a replica's identity to a live server connection
    pub fn repl_server_update_client_conn_map(&self, ip_port: &str, conn_id: u64) {
        self.server.update_client_conn_map(ip_port, conn_id);
    }
}

#[async_trait]
impl RequestHandler for ReplicaManager {
    async fn handle_request(
        &self,
        conn_id: u64,
        req: ReplRequest,
    ) -> Result<Option<ReplResponse>> {
        match req {
            ReplRequest::MetaSync { local_ip, port } => {
                self.server
                    .update_client_conn_map(&format!("{local_ip}:{port}"), conn_id);
                Ok(Some(ReplResponse::MetaSync { ok: true }))
            }

            ReplRequest::TrySync {
                node,
                offset,
                local_ip: _,
                master_term,
            } => {
                let info = node.partition.clone();
                let master = self.master_partition(&info)?;
                let storage = self.context.partition(&info)?;
                self.server.update_client_conn_map(&node.addr(), conn_id);

                let tip = storage.binlog_offset();
                if offset > tip || !storage.binlog().is_record_boundary(offset) {
                    // Ahead of us or pointing at purged history: only a
                    // full dump can help, no session yet
                    return Ok(Some(ReplResponse::TrySync {
                        partition: info,
                        session_id: 0,
                        reply: TrySyncReply::FullSyncNeeded,
                    }));
                }

                let session_id = master.gen_session_id();
                let tracked =
                    RmNode::with_session(node.ip.clone(), node.port, info.clone(), session_id);
                self.add_partition_slave(&tracked, master_term)?;
                Ok(Some(ReplResponse::TrySync {
                    partition: info,
                    session_id,
                    reply: TrySyncReply::CatchUp { offset },
                }))
            }

            ReplRequest::DbSync {
                node,
                offset: _,
                local_ip: _,
                master_term,
            } => {
                let info = node.partition.clone();
                self.server.update_client_conn_map(&node.addr(), conn_id);
                let master = self.master_partition(&info)?;
                let session_id = master.gen_session_id();
                let tracked =
                    RmNode::with_session(node.ip.clone(), node.port, info.clone(), session_id);
                self.add_partition_slave(&tracked, master_term)?;
                self.activate_db_sync(&tracked)?;
                Ok(Some(ReplResponse::DbSync {
                    partition: info,
                    session_id,
                }))
            }

            ReplRequest::BinlogSync {
                node,
                ack_start,
                ack_end,
                local_ip: _,
                is_first,
            } => {
                if !self.check_master_partition_session_id(
                    &node.ip,
                    node.port,
                    &node.partition.table_name,
                    node.partition.partition_id,
                    node.session_id,
                ) {
                    return Err(Error::Corruption(format!(
                        "binlog sync from {} with bad session {}",
                        node.addr(),
                        node.session_id
                    )));
                }
                self.set_master_last_recv_time(&node, now_micros())?;

                if is_first {
                    if ack_start != ack_end {
                        return Err(Error::Corruption(format!(
                            "first ack from {} carries a range [{ack_start}, {ack_end}]",
                            node.addr()
                        )));
                    }
                    // The first ack names the offset streaming starts at
                    self.activate_binlog_sync(&node, ack_end)?;
                } else {
                    self.update_sync_binlog_status(&node, ack_start, ack_end)?;
                }
                Ok(None)
            }

            ReplRequest::RemoveSlaveNode {
                node,
                local_ip: _,
                master_term: _,
            } => {
                self.remove_partition_slave(&node)?;
                Ok(Some(ReplResponse::RemoveSlaveNode { ok: true }))
            }
        }
    }

    async fn handle_connection_lost(&self, addr: &str) {
        if let Some((ip, port)) = addr
            .rsplit_once(':')
            .and_then(|(ip, port)| Some((ip.to_string(), port.parse::<u16>().ok()?)))
        {
            let _ = self.lost_connection(&ip, port);
        }
    }
}

#[async_trait]
impl ResponseHandler for ReplicaManager {
    async fn handle_response(&self, peer: &RmNode, resp: ReplResponse) -> Result<()> {
        match resp {
            ReplResponse::MetaSync { ok } => {
                tracing::info!("Meta sync to {} replied ok={ok}", peer.addr());
                Ok(())
            }

            ReplResponse::TrySync {
                partition: info,
                session_id,
                reply,
            } => {
                let partition = self.slave_partition(&info)?;
                let master_term = partition.master_term();
                match reply {
                    TrySyncReply::CatchUp { offset } => {
                        partition.set_master_session_id(session_id);
                        self.send_partition_binlog_sync_ack_request(
                            &info.table_name,
                            info.partition_id,
                            offset,
                            offset,
                            true,
                        )
                        .await?;
                        partition.cas_repl_state(
                            ReplState::WaitReply,
                            master_term,
                            ReplState::Connected,
                            "try sync accepted",
                        )
                    }
                    TrySyncReply::FullSyncNeeded => partition.cas_repl_state(
                        ReplState::WaitReply,
                        master_term,
                        ReplState::TryDbSync,
                        "sync point unavailable, falling back to full sync",
                    ),
                }
            }

            ReplResponse::DbSync {
                partition: info,
                session_id,
            } => {
                let partition = self.slave_partition(&info)?;
                partition.set_master_session_id(session_id);
                partition.cas_repl_state(
                    ReplState::WaitReply,
                    partition.master_term(),
                    ReplState::WaitDbSync,
                    "db sync accepted",
                )
            }

            ReplResponse::RemoveSlaveNode { ok } => {
                tracing::info!("Remove slave node towards {} replied ok={ok}", peer.addr());
                Ok(())
            }

            ReplResponse::BinlogChips { tasks } => {
                let now = now_micros();
                // Chips arrive in offset order per partition; acks cover
                // the contiguous range received in this batch
                let mut ack_ranges: HashMap<PartitionInfo, (BinlogOffset, BinlogOffset)> =
                    HashMap::new();
                let mut to_apply: HashMap<PartitionInfo, Vec<WriteTask>> = HashMap::new();

                for task in tasks {
                    let info = task.target.partition.clone();
                    let partition = self.slave_partition(&info)?;
                    if task.master_term != partition.master_term() {
                        tracing::warn!(
                            "Dropping chip for {info} under stale term {} (current {})",
                            task.master_term,
                            partition.master_term()
                        );
                        continue;
                    }
                    partition.set_last_recv_time(now);
                    if task.chip.is_keepalive() {
                        continue;
                    }
                    if !self.check_slave_partition_session_id(
                        &info.table_name,
                        info.partition_id,
                        task.target.session_id,
                    ) {
                        continue;
                    }

                    let offset = task.chip.offset;
                    ack_ranges
                        .entry(info.clone())
                        .and_modify(|(_, end)| *end = offset)
                        .or_insert((offset, offset));
                    to_apply.entry(info).or_default().push(task);
                }

                for (info, tasks) in to_apply {
                    let key = format!("{}_{}", info.table_name, info.partition_id);
                    self.schedule_write_binlog_task(&key, tasks);
                }
                for (info, (start, end)) in ack_ranges {
                    self.send_partition_binlog_sync_ack_request(
                        &info.table_name,
                        info.partition_id,
                        start,
                        end,
                        false,
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::BinlogChip;
    use crate::config::PackSyncConfig;
    use crate::network::mock::{RecordingClient, RecordingServer};
    use crate::store::{LocalStore, PartitionStore};
    use std::sync::atomic::Ordering as AtomicOrdering;
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        manager: Arc<ReplicaManager>,
        client: Arc<RecordingClient>,
        server: Arc<RecordingServer>,
        store: Arc<LocalStore>,
    }

    fn build() -> Harness {
        let dir = tempdir().unwrap();
        let config = PackSyncConfig::from_str(&format!(
            r#"
[node]
bind_address = "127.0.0.1:9221"
data_dir = "{}"

[[tables]]
name = "db0"
partition_ids = [1]
partition_num = 2

[replication]
sync_window_size = 4
"#,
            dir.path().display()
        ))
        .unwrap();

        let store = Arc::new(LocalStore::from_config(&config));
        let context = ServerContext::new(config, Arc::clone(&store) as _);
        let client = Arc::new(RecordingClient::default());
        let server = Arc::new(RecordingServer::default());
        let manager = ReplicaManager::new(
            context,
            Arc::clone(&client) as _,
            Arc::clone(&server) as _,
        )
        .unwrap();
        manager.init_master_terms().unwrap();
        Harness {
            _dir: dir,
            manager,
            client,
            server,
            store,
        }
    }

    fn info() -> PartitionInfo {
        PartitionInfo::new("db0", 1)
    }

    fn replica(ip: &str) -> RmNode {
        RmNode::new(ip, 9221, info())
    }

    /// A listening socket the local-ip probe can reach
    async fn probe_target() -> (tokio::net::TcpListener, String, u16) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn test_activate_and_state_machine_try_sync() {
        let h = build();
        let (_listener, master_ip, master_port) = probe_target().await;

        let master = RmNode::new(master_ip.clone(), master_port, info());
        h.manager
            .activate_sync_slave_partition(&master, ReplState::TryConnect, false)
            .await
            .unwrap();

        let slave = h.manager.sync_slave_partition(&info()).unwrap();
        assert_eq!(slave.state(), ReplState::TryConnect);
        assert_eq!(slave.master_term(), 1);
        assert!(!slave.local_ip().is_empty());

        // The tick sends the try-sync and parks the partition in WaitReply
        h.manager
            .run_sync_slave_partition_state_machine()
            .await
            .unwrap();
        assert_eq!(slave.state(), ReplState::WaitReply);
        let calls = h.client.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with(&format!("try_sync {master_ip}:{master_port}")));

        // Further ticks leave WaitReply alone
        h.manager
            .run_sync_slave_partition_state_machine()
            .await
            .unwrap();
        assert_eq!(h.client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_activate_rejects_busy_partition() {
        let h = build();
        let (_listener, master_ip, master_port) = probe_target().await;
        let master = RmNode::new(master_ip, master_port, info());

        h.manager
            .activate_sync_slave_partition(&master, ReplState::TryConnect, false)
            .await
            .unwrap();
        let err = h
            .manager
            .activate_sync_slave_partition(&master, ReplState::TryConnect, false)
            .await
            .unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_try_sync_send_failure_enters_error() {
        let h = build();
        let (_listener, master_ip, master_port) = probe_target().await;
        let master = RmNode::new(master_ip, master_port, info());
        h.manager
            .activate_sync_slave_partition(&master, ReplState::TryConnect, false)
            .await
            .unwrap();

        h.client.fail_sends.store(true, AtomicOrdering::Relaxed);
        h.manager
            .run_sync_slave_partition_state_machine()
            .await
            .unwrap();
        let slave = h.manager.sync_slave_partition(&info()).unwrap();
        assert_eq!(slave.state(), ReplState::Error);
    }

    #[tokio::test]
    async fn test_try_sync_reply_catch_up_connects_and_acks_first() {
        let h = build();
        let (_listener, master_ip, master_port) = probe_target().await;
        let master = RmNode::new(master_ip.clone(), master_port, info());
        h.manager
            .activate_sync_slave_partition(&master, ReplState::TryConnect, false)
            .await
            .unwrap();
        h.manager
            .run_sync_slave_partition_state_machine()
            .await
            .unwrap();

        let offset = BinlogOffset::new(0, 0);
        h.manager
            .handle_response(
                &master,
                ReplResponse::TrySync {
                    partition: info(),
                    session_id: 7,
                    reply: TrySyncReply::CatchUp { offset },
                },
            )
            .await
            .unwrap();

        let slave = h.manager.sync_slave_partition(&info()).unwrap();
        assert_eq!(slave.state(), ReplState::Connected);
        assert_eq!(slave.master_session_id(), 7);
        let calls = h.client.calls();
        assert!(calls
            .iter()
            .any(|c| c.starts_with("binlog_sync") && c.ends_with("first=true")));
    }

    #[tokio::test]
    async fn test_try_sync_reply_full_sync_walks_db_sync_path() {
        let h = build();
        let (_listener, master_ip, master_port) = probe_target().await;
        let master = RmNode::new(master_ip, master_port, info());
        h.manager
            .activate_sync_slave_partition(&master, ReplState::TryConnect, false)
            .await
            .unwrap();
        h.manager
            .run_sync_slave_partition_state_machine()
            .await
            .unwrap();

        h.manager
            .handle_response(
                &master,
                ReplResponse::TrySync {
                    partition: info(),
                    session_id: 0,
                    reply: TrySyncReply::FullSyncNeeded,
                },
            )
            .await
            .unwrap();
        let slave = h.manager.sync_slave_partition(&info()).unwrap();
        assert_eq!(slave.state(), ReplState::TryDbSync);

        // Next tick sends the db-sync and parks in WaitReply again
        h.manager
            .run_sync_slave_partition_state_machine()
            .await
            .unwrap();
        assert_eq!(slave.state(), ReplState::WaitReply);
        assert!(h.client.calls().iter().any(|c| c.starts_with("db_sync")));

        // Master accepts; we wait for the dump
        h.manager
            .handle_response(
                &master,
                ReplResponse::DbSync {
                    partition: info(),
                    session_id: 9,
                },
            )
            .await
            .unwrap();
        assert_eq!(slave.state(), ReplState::WaitDbSync);
        assert_eq!(slave.master_session_id(), 9);

        // Dump lands; the tick adopts the offset and connects
        let storage = h.store.local_partition(&info()).unwrap();
        storage.set_pending_master_offset(BinlogOffset::new(3, 0));
        h.manager
            .run_sync_slave_partition_state_machine()
            .await
            .unwrap();
        assert_eq!(slave.state(), ReplState::Connected);
    }

    #[tokio::test]
    async fn test_resharding_adoption_scrubs_foreign_keys() {
        let h = build();
        let (_listener, master_ip, master_port) = probe_target().await;
        let master = RmNode::new(master_ip, master_port, info());
        h.manager
            .activate_sync_slave_partition(&master, ReplState::TryConnect, true)
            .await
            .unwrap();

        let slave = h.manager.sync_slave_partition(&info()).unwrap();
        assert!(slave.resharding());
        slave.set_repl_state(ReplState::WaitDbSync);

        let storage = h.store.local_partition(&info()).unwrap();
        // Find one key that routes here and one that does not
        let keys: Vec<String> = (0..64).map(|i| format!("key-{i}")).collect();
        let own = keys
            .iter()
            .find(|k| h.store.partition_id_for_key("db0", k) == Some(1))
            .unwrap()
            .clone();
        let foreign = keys
            .iter()
            .find(|k| h.store.partition_id_for_key("db0", k) != Some(1))
            .unwrap()
            .clone();
        storage.apply_write(&own, b"x");
        storage.apply_write(&foreign, b"x");

        storage.set_pending_master_offset(BinlogOffset::new(1, 0));
        h.manager
            .run_sync_slave_partition_state_machine()
            .await
            .unwrap();

        let kept = storage.keys();
        assert!(kept.contains(&own));
        assert!(!kept.contains(&foreign));
    }

    #[tokio::test]
    async fn test_master_handshake_and_binlog_sync_flow() {
        let h = build();
        let storage = h.store.local_partition(&info()).unwrap();
        for i in 0..6 {
            storage.apply_write(&format!("k{i}"), b"0123456789");
        }

        // A remote slave asks to catch up from the start
        let resp = h
            .manager
            .handle_request(
                11,
                ReplRequest::TrySync {
                    node: replica("10.0.0.2"),
                    offset: BinlogOffset::default(),
                    local_ip: "10.0.0.2".into(),
                    master_term: 4,
                },
            )
            .await
            .unwrap()
            .unwrap();
        let session_id = match resp {
            ReplResponse::TrySync {
                session_id,
                reply: TrySyncReply::CatchUp { offset },
                ..
            } => {
                assert_eq!(offset, BinlogOffset::default());
                session_id
            }
            other => panic!("unexpected reply {}", other.type_name()),
        };
        assert!(h
            .manager
            .check_partition_slave_exist(&replica("10.0.0.2")));

        // Its first ack activates streaming; the window fills
        let node = RmNode::with_session("10.0.0.2", 9221, info(), session_id);
        h.manager
            .handle_request(
                11,
                ReplRequest::BinlogSync {
                    node: node.clone(),
                    ack_start: BinlogOffset::default(),
                    ack_end: BinlogOffset::default(),
                    local_ip: "10.0.0.2".into(),
                    is_first: true,
                },
            )
            .await
            .unwrap();
        let (sent, acked) = h.manager.get_sync_binlog_status(&node).unwrap();
        assert_eq!(sent, BinlogOffset::new(0, 40));
        assert_eq!(acked, BinlogOffset::default());

        // The pump flushes the four chips to the slave's connection
        assert_eq!(h.manager.consume_write_queue().await, 4);
        let batches = h.server.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, "10.0.0.2:9221");

        // Acking the first two frees the window and refills it
        h.manager
            .handle_request(
                11,
                ReplRequest::BinlogSync {
                    node: node.clone(),
                    ack_start: BinlogOffset::new(0, 10),
                    ack_end: BinlogOffset::new(0, 20),
                    local_ip: "10.0.0.2".into(),
                    is_first: false,
                },
            )
            .await
            .unwrap();
        let (sent, acked) = h.manager.get_sync_binlog_status(&node).unwrap();
        assert_eq!(acked, BinlogOffset::new(0, 20));
        assert_eq!(sent, BinlogOffset::new(0, 60));
    }

    #[tokio::test]
    async fn test_binlog_sync_with_bad_session_rejected() {
        let h = build();
        let resp = h
            .manager
            .handle_request(
                3,
                ReplRequest::TrySync {
                    node: replica("10.0.0.2"),
                    offset: BinlogOffset::default(),
                    local_ip: "10.0.0.2".into(),
                    master_term: 1,
                },
            )
            .await
            .unwrap();
        assert!(resp.is_some());

        let bogus = RmNode::with_session("10.0.0.2", 9221, info(), 9999);
        let err = h
            .manager
            .handle_request(
                3,
                ReplRequest::BinlogSync {
                    node: bogus,
                    ack_start: BinlogOffset::default(),
                    ack_end: BinlogOffset::default(),
                    local_ip: "10.0.0.2".into(),
                    is_first: true,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_try_sync_ahead_of_tip_needs_full_sync() {
        let h = build();
        let resp = h
            .manager
            .handle_request(
                5,
                ReplRequest::TrySync {
                    node: replica("10.0.0.2"),
                    offset: BinlogOffset::new(9, 0),
                    local_ip: "10.0.0.2".into(),
                    master_term: 1,
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            resp,
            ReplResponse::TrySync {
                reply: TrySyncReply::FullSyncNeeded,
                ..
            }
        ));
        // No session was handed out
        assert!(!h.manager.check_partition_slave_exist(&replica("10.0.0.2")));
    }

    #[tokio::test]
    async fn test_lost_connection_clears_both_roles() {
        let h = build();
        let (_listener, master_ip, master_port) = probe_target().await;

        // As master: track a replica at the lost endpoint
        h.manager
            .add_partition_slave(&RmNode::new(master_ip.clone(), master_port, info()), 1)
            .unwrap();
        // As slave: follow a master at the lost endpoint
        let master = RmNode::new(master_ip.clone(), master_port, info());
        h.manager
            .activate_sync_slave_partition(&master, ReplState::TryConnect, false)
            .await
            .unwrap();

        h.manager.lost_connection(&master_ip, master_port).unwrap();
        assert!(!h.manager.check_partition_slave_exist(&master));
        let slave = h.manager.sync_slave_partition(&info()).unwrap();
        assert_eq!(slave.state(), ReplState::NoConnect);
        assert!(slave.master_ip().is_empty());
    }

    #[tokio::test]
    async fn test_meta_sync_rate_limited() {
        let h = build();
        h.manager
            .send_meta_sync_request("10.0.0.5", 9221)
            .await
            .unwrap();
        h.manager
            .send_meta_sync_request("10.0.0.5", 9221)
            .await
            .unwrap();
        assert_eq!(
            h.client
                .calls()
                .iter()
                .filter(|c| c.starts_with("meta_sync"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_add_remove_sync_partitions() {
        let h = build();
        let extra = PartitionInfo::new("db0", 1);
        // Already registered
        assert!(h
            .manager
            .add_sync_partitions(&[extra.clone()])
            .unwrap_err()
            .is_corruption());

        // Removal is refused while a replica is attached
        h.manager
            .add_partition_slave(&replica("10.0.0.2"), 1)
            .unwrap();
        assert!(h
            .manager
            .remove_sync_partitions(&[info()])
            .unwrap_err()
            .is_corruption());

        h.manager
            .remove_partition_slave(&replica("10.0.0.2"))
            .unwrap();
        h.manager.remove_sync_partitions(&[info()]).unwrap();
        assert!(h.manager.sync_master_partition(&info()).is_none());
        assert!(h.manager.sync_slave_partition(&info()).is_none());
    }

    #[tokio::test]
    async fn test_partition_role() {
        let h = build();
        let role = h.manager.partition_role("db0", 1).unwrap();
        assert_eq!(role, PartitionRole::default());

        h.manager
            .add_partition_slave(&replica("10.0.0.2"), 1)
            .unwrap();
        let role = h.manager.partition_role("db0", 1).unwrap();
        assert!(role.master);
        assert!(!role.slave);
    }

    #[tokio::test]
    async fn test_common_master_and_db_connect_queries() {
        let h = build();
        let (_listener, master_ip, master_port) = probe_target().await;
        let master = RmNode::new(master_ip.clone(), master_port, info());

        // Not connected yet: no common master, reconnects allowed
        assert_eq!(h.manager.find_common_master(), None);
        assert!(h.manager.check_slave_db_connect());

        h.manager
            .activate_sync_slave_partition(&master, ReplState::TryConnect, false)
            .await
            .unwrap();
        let slave = h.manager.sync_slave_partition(&info()).unwrap();
        slave
            .cas_repl_state(ReplState::TryConnect, 1, ReplState::Connected, "test")
            .unwrap();
        assert_eq!(
            h.manager.find_common_master(),
            Some(format!("{master_ip}:{master_port}"))
        );

        // An explicitly unfollowed partition blocks reconnects
        slave.set_repl_state(ReplState::DbNoConnect);
        assert!(!h.manager.check_slave_db_connect());
    }

    #[tokio::test]
    async fn test_chips_dropped_under_stale_term() {
        let h = build();
        let (_listener, master_ip, master_port) = probe_target().await;
        let master = RmNode::new(master_ip, master_port, info());
        h.manager
            .activate_sync_slave_partition(&master, ReplState::TryConnect, false)
            .await
            .unwrap();

        let slave = h.manager.sync_slave_partition(&info()).unwrap();
        slave.set_master_session_id(4);
        let target = RmNode::with_session(master.ip.clone(), master.port, info(), 4);

        // A push from a previous term is dropped without an ack
        let stale_term = slave.master_term() - 1;
        h.manager
            .handle_response(
                &master,
                ReplResponse::BinlogChips {
                    tasks: vec![WriteTask::new(
                        target.clone(),
                        stale_term,
                        BinlogChip::new(BinlogOffset::new(0, 10), b"x".to_vec()),
                    )],
                },
            )
            .await
            .unwrap();
        assert!(!h.client.calls().iter().any(|c| c.starts_with("binlog_sync")));

        // The same push under the current term is applied and acked
        h.manager
            .handle_response(
                &master,
                ReplResponse::BinlogChips {
                    tasks: vec![WriteTask::new(
                        target,
                        slave.master_term(),
                        BinlogChip::new(BinlogOffset::new(0, 10), b"x".to_vec()),
                    )],
                },
            )
            .await
            .unwrap();
        let calls = h.client.calls();
        assert!(calls.iter().any(|c| c.starts_with("write_binlog")));
        assert!(calls.iter().any(|c| c.starts_with("binlog_sync")));
    }

    #[tokio::test]
    async fn test_timeout_sweep_resets_silent_slave_partition() {
        let h = build();
        let (_listener, master_ip, master_port) = probe_target().await;
        let master = RmNode::new(master_ip, master_port, info());
        h.manager
            .activate_sync_slave_partition(&master, ReplState::TryConnect, false)
            .await
            .unwrap();
        let slave = h.manager.sync_slave_partition(&info()).unwrap();
        slave
            .cas_repl_state(ReplState::TryConnect, 1, ReplState::Connected, "test")
            .unwrap();

        let now = slave.last_recv_time() + super::super::RECV_KEEPALIVE_TIMEOUT_US + 1;
        h.manager.check_sync_timeout(now).unwrap();
        assert_eq!(slave.state(), ReplState::TryConnect);
        assert_eq!(slave.master_term(), 2);
    }
}
