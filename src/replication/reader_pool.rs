//! Binlog Reader Pool
//!
//! Readers are reusable and expensive enough to keep around, so checkouts
//! are tracked per replica: a replica can hold at most one reader at a
//! time, which also guards against two writers seeking the same reader.

use parking_lot::Mutex;
use std::collections::HashSet;

use super::node::RmNode;
use crate::binlog::BinlogReader;
use crate::error::{Error, Result};

type ReaderFactory = Box<dyn Fn() -> Box<dyn BinlogReader> + Send + Sync>;

struct PoolInner {
    occupied: HashSet<RmNode>,
    vacant: Vec<Box<dyn BinlogReader>>,
}

/// Pool of reusable binlog readers with at-most-one checkout per replica
pub struct BinlogReaderPool {
    inner: Mutex<PoolInner>,
    factory: ReaderFactory,
}

impl BinlogReaderPool {
    /// Create a pool that builds fresh readers with `factory` when the
    /// vacant list runs dry
    pub fn new(factory: impl Fn() -> Box<dyn BinlogReader> + Send + Sync + 'static) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                occupied: HashSet::new(),
                vacant: Vec::new(),
            }),
            factory: Box::new(factory),
        }
    }

    /// Check out a reader for `rm_node`. Fails with Corruption if the
    /// replica already holds one.
    pub fn fetch(&self, rm_node: &RmNode) -> Result<Box<dyn BinlogReader>> {
        let mut inner = self.inner.lock();
        if inner.occupied.contains(rm_node) {
            return Err(Error::Corruption(format!(
                "binlog reader for {rm_node} already checked out"
            )));
        }
        let reader = inner.vacant.pop().unwrap_or_else(|| (self.factory)());
        inner.occupied.insert(rm_node.clone());
        Ok(reader)
    }

    /// Return a checked-out reader. NotFound if the replica never fetched
    /// one; callers tearing down a slave tolerate that.
    pub fn release(&self, rm_node: &RmNode, reader: Box<dyn BinlogReader>) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.occupied.remove(rm_node) {
            return Err(Error::NotFound(format!("{rm_node} holds no binlog reader")));
        }
        inner.vacant.push(reader);
        Ok(())
    }

    /// Number of checked-out readers
    pub fn occupied_count(&self) -> usize {
        self.inner.lock().occupied.len()
    }

    /// Number of idle readers available for reuse
    pub fn vacant_count(&self) -> usize {
        self.inner.lock().vacant.len()
    }
}
