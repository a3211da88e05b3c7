//! Slave-Side Partition View
//!
//! For a partition following a remote master, tracks the master address,
//! the replication lifecycle state, and the durable master term. Every
//! transition is a compare-and-swap guarded by both an allowed-state set
//! and the expected term, so work scheduled under an old master cannot
//! commit after a reset.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};

use super::node::{PartitionInfo, RmNode};
use super::{now_micros, RECV_KEEPALIVE_TIMEOUT_US};
use crate::error::{Error, Result};
use crate::store::Partition;

/// Replication lifecycle of a slave partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplState {
    NoConnect,
    TryConnect,
    TryDbSync,
    WaitDbSync,
    WaitReply,
    Connected,
    Error,
    DbNoConnect,
}

impl ReplState {
    /// States in which silence from the master counts against the
    /// keepalive window
    pub fn needs_sync_timeout_check(&self) -> bool {
        matches!(
            self,
            ReplState::WaitDbSync | ReplState::WaitReply | ReplState::Connected
        )
    }
}

impl std::fmt::Display for ReplState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplState::NoConnect => "NoConnect",
            ReplState::TryConnect => "TryConnect",
            ReplState::TryDbSync => "TryDbSync",
            ReplState::WaitDbSync => "WaitDbSync",
            ReplState::WaitReply => "WaitReply",
            ReplState::Connected => "Connected",
            ReplState::Error => "Error",
            ReplState::DbNoConnect => "DbNoConnect",
        };
        write!(f, "{s}")
    }
}

/// The states a timed-out slave partition may be reset from
pub(crate) const SYNC_TIMEOUT_STATES: [ReplState; 3] = [
    ReplState::WaitDbSync,
    ReplState::WaitReply,
    ReplState::Connected,
];

struct SlaveInner {
    master: RmNode,
    master_term: u32,
    repl_state: ReplState,
    local_ip: String,
    resharding: bool,
    last_recv_us: u64,
}

impl SlaveInner {
    /// Point the partition at `new_master`. A non-empty master bumps and
    /// persists the term before anything is committed; any I/O failure
    /// leaves both the master and the term untouched. An empty master
    /// touches neither the file nor the term.
    fn set_master(
        &mut self,
        info: &PartitionInfo,
        term_file: &Path,
        new_master: RmNode,
        reason: &str,
    ) -> Result<()> {
        let old_addr = self.master.addr();

        if new_master.ip.is_empty() {
            if self.master.ip != new_master.ip || self.master.port != new_master.port {
                tracing::info!(
                    "Change master of partition {info} from '{old_addr}' to '{}', \
                     unchanged master term: {}, reason: {reason}",
                    new_master.addr(),
                    self.master_term
                );
            }
            self.master = new_master;
            return Ok(());
        }

        let dir = term_file.parent().ok_or_else(|| {
            Error::Corruption(format!(
                "term info file '{}' has no parent directory, reason: {reason}",
                term_file.display()
            ))
        })?;
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Corruption(format!(
                    "can't create term info dir '{}': {e}, reason: {reason}",
                    dir.display()
                ))
            })?;
        }

        let new_term = self.master_term + 1;
        std::fs::write(term_file, new_term.to_string()).map_err(|e| {
            Error::Corruption(format!(
                "can't write term info file '{}': {e}, reason: {reason}",
                term_file.display()
            ))
        })?;

        self.master_term = new_term;
        self.master = new_master;
        self.last_recv_us = now_micros();
        tracing::info!(
            "Change master of partition {info} from '{old_addr}' to '{}', \
             new master term: {new_term}, reason: {reason}",
            self.master.addr()
        );
        Ok(())
    }

    /// Re-point at the current master with a reset session, bumping the term
    fn reset_master(&mut self, info: &PartitionInfo, term_file: &Path, reason: &str) -> Result<()> {
        let mut old = self.master.clone();
        old.session_id = 0;
        self.set_master(info, term_file, old, reason)
    }

    /// Apply a state; entering NoConnect clears the master without touching
    /// the term
    fn set_repl_state(&mut self, info: &PartitionInfo, term_file: &Path, repl_state: ReplState) {
        if repl_state == ReplState::NoConnect {
            let _ = self.set_master(
                info,
                term_file,
                RmNode::default(),
                "state reset to NoConnect",
            );
        }
        self.repl_state = repl_state;
    }
}

/// Slave view of one local partition
pub struct SyncSlavePartition {
    info: PartitionInfo,
    term_file: PathBuf,
    inner: RwLock<SlaveInner>,
}

impl SyncSlavePartition {
    /// Create the slave view of `info`, persisting its term to `term_file`
    pub fn new(info: PartitionInfo, term_file: PathBuf) -> Self {
        Self {
            info,
            term_file,
            inner: RwLock::new(SlaveInner {
                master: RmNode::default(),
                master_term: 0,
                repl_state: ReplState::NoConnect,
                local_ip: String::new(),
                resharding: false,
                last_recv_us: now_micros(),
            }),
        }
    }

    /// The partition identity
    pub fn partition_info(&self) -> &PartitionInfo {
        &self.info
    }

    /// Load the durable master term from the storage partition
    pub fn init_master_term(&self, storage: &dyn Partition) -> Result<()> {
        let term = storage.master_term()?;
        self.inner.write().master_term = term;
        tracing::info!(
            "Initialize master term of slave partition {} to {term}",
            self.info
        );
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> ReplState {
        self.inner.read().repl_state
    }

    /// Current master term
    pub fn master_term(&self) -> u32 {
        self.inner.read().master_term
    }

    /// The followed master's ip (empty when not following)
    pub fn master_ip(&self) -> String {
        self.inner.read().master.ip.clone()
    }

    /// The followed master's port
    pub fn master_port(&self) -> u16 {
        self.inner.read().master.port
    }

    /// The followed master's `ip:port`
    pub fn master_addr(&self) -> String {
        self.inner.read().master.addr()
    }

    /// Session id granted by the master
    pub fn master_session_id(&self) -> i32 {
        self.inner.read().master.session_id
    }

    /// Adopt the session id granted by the master
    pub fn set_master_session_id(&self, session_id: i32) {
        self.inner.write().master.session_id = session_id;
    }

    /// The local ip the master reaches us back on
    pub fn local_ip(&self) -> String {
        self.inner.read().local_ip.clone()
    }

    /// Record the local ip; set once per activation
    pub fn set_local_ip(&self, local_ip: String) {
        self.inner.write().local_ip = local_ip;
    }

    /// Whether this partition is mid-reshard
    pub fn resharding(&self) -> bool {
        self.inner.read().resharding
    }

    /// Flip the resharding flag
    pub fn set_resharding(&self, resharding: bool) {
        self.inner.write().resharding = resharding;
    }

    /// Microseconds timestamp of the last message from the master
    pub fn last_recv_time(&self) -> u64 {
        self.inner.read().last_recv_us
    }

    /// Stamp the last receive time
    pub fn set_last_recv_time(&self, time: u64) {
        self.inner.write().last_recv_us = time;
    }

    /// Force a state without any guard (operator paths)
    pub fn set_repl_state(&self, repl_state: ReplState) {
        let mut inner = self.inner.write();
        inner.set_repl_state(&self.info, &self.term_file, repl_state);
    }

    /// Term-guarded CAS from one expected state
    pub fn cas_repl_state(
        &self,
        exp_state: ReplState,
        exp_master_term: u32,
        new_state: ReplState,
        reason: &str,
    ) -> Result<()> {
        self.cas_repl_state_with(&[exp_state], exp_master_term, |_| Ok(()), new_state, reason)
    }

    /// Term-guarded CAS: the transition commits only if the current state
    /// is allowed, the term matches, and `action` (run under the write
    /// lock) succeeds. States that resume activity restart the keepalive
    /// clock.
    fn cas_repl_state_with(
        &self,
        allowed_states: &[ReplState],
        exp_master_term: u32,
        action: impl FnOnce(&mut SlaveInner) -> Result<()>,
        new_state: ReplState,
        reason: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write();

        if !allowed_states.contains(&inner.repl_state) {
            let err = Error::Incomplete(format!(
                "CAS partition {} state to '{new_state}' state check failed, \
                 expected states: {}, but current state is '{}'",
                self.info,
                state_list(allowed_states),
                inner.repl_state
            ));
            tracing::warn!("{err}, cas reason: {reason}");
            return Err(err);
        }

        // The term guard closes the ABA window: a reset between read and
        // CAS bumps the term and strands the stale caller here
        if exp_master_term != inner.master_term {
            let err = Error::Incomplete(format!(
                "CAS partition {} state to '{new_state}' term check failed, \
                 expected term {exp_master_term}, but current term is {}",
                self.info, inner.master_term
            ));
            tracing::warn!("{err}, cas reason: {reason}");
            return Err(err);
        }

        action(&mut inner)?;

        let line = format!(
            "CAS partition {} state from '{}' term {exp_master_term} to '{new_state}' \
             successfully, cas reason: {reason}",
            self.info, inner.repl_state
        );
        match new_state {
            ReplState::Error
            | ReplState::TryConnect
            | ReplState::NoConnect
            | ReplState::DbNoConnect => tracing::warn!("{line}"),
            _ => tracing::info!("{line}"),
        }

        inner.set_repl_state(&self.info, &self.term_file, new_state);
        if new_state.needs_sync_timeout_check() {
            inner.last_recv_us = now_micros();
        }
        Ok(())
    }

    /// Start following `master` in `repl_state`, bumping and persisting
    /// the term
    pub fn activate(&self, master: RmNode, repl_state: ReplState) -> Result<()> {
        let mut inner = self.inner.write();
        if master.ip.is_empty() || master.port == 0 {
            return Err(Error::Corruption(format!(
                "invalid master addr '{}'",
                master.addr()
            )));
        }
        if master.ip == inner.master.ip && master.port == inner.master.port {
            return Err(Error::Corruption(format!(
                "same master '{}' as previous one",
                master.addr()
            )));
        }

        inner.set_master(&self.info, &self.term_file, master, "Activate Replication")?;
        inner.set_repl_state(&self.info, &self.term_file, repl_state);
        Ok(())
    }

    /// Stop following; the master is cleared and the term stays put
    pub fn deactivate(&self) {
        let mut inner = self.inner.write();
        inner.set_repl_state(&self.info, &self.term_file, ReplState::NoConnect);
    }

    /// Explicit reset back to TryConnect under the given term
    pub fn reset_replication(&self, master_term: u32, reason: &str) -> Result<()> {
        self.cas_repl_state_with(
            &[ReplState::Connected, ReplState::WaitDbSync],
            master_term,
            |inner| inner.reset_master(&self.info, &self.term_file, reason),
            ReplState::TryConnect,
            reason,
        )
    }

    /// Reset the partition if the master has gone silent past the
    /// keepalive window. Returns whether a reset happened, so the caller
    /// can re-drive the state machine.
    pub fn check_sync_timeout(&self, now: u64) -> bool {
        let master_term = {
            let inner = self.inner.read();
            if !inner.repl_state.needs_sync_timeout_check() {
                return false;
            }
            if inner.last_recv_us + RECV_KEEPALIVE_TIMEOUT_US >= now {
                return false;
            }
            inner.master_term
        };

        self.cas_repl_state_with(
            &SYNC_TIMEOUT_STATES,
            master_term,
            |inner| {
                // Re-check under the write lock: a message may have landed
                // between the read above and here
                if inner.last_recv_us + RECV_KEEPALIVE_TIMEOUT_US < now {
                    inner.reset_master(&self.info, &self.term_file, "sync recv timeout")
                } else {
                    Err(Error::Incomplete("sync not timed out, skip".into()))
                }
            },
            ReplState::TryConnect,
            "sync recv timeout",
        )
        .is_ok()
    }
}

fn state_list(states: &[ReplState]) -> String {
    states
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(" or ")
}
