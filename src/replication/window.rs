//! Sliding Send Window
//!
//! Tracks the binlog records in flight to one slave. Records enter in
//! binlog order; acks may land out of order, but the window head only
//! advances over a contiguous acked prefix, which is what makes the acked
//! offset safe to report to purge decisions.

use std::collections::VecDeque;

use crate::binlog::BinlogOffset;
use crate::error::{Error, Result};

/// One in-flight binlog record
#[derive(Debug, Clone, Copy)]
pub struct SyncWinItem {
    pub offset: BinlogOffset,
    pub acked: bool,
}

impl SyncWinItem {
    /// A fresh, unacked item
    pub fn new(offset: BinlogOffset) -> Self {
        Self {
            offset,
            acked: false,
        }
    }
}

impl PartialEq for SyncWinItem {
    // Ack matching compares offsets only
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl Eq for SyncWinItem {}

/// Ordered window of at most `size` in-flight records
#[derive(Debug)]
pub struct SyncWindow {
    win: VecDeque<SyncWinItem>,
    size: usize,
}

impl SyncWindow {
    /// Create an empty window holding at most `size` items
    pub fn new(size: usize) -> Self {
        Self {
            win: VecDeque::new(),
            size,
        }
    }

    /// Append an item at the tail. The caller checks `remaining()` first;
    /// pushes must arrive in binlog order.
    pub fn push(&mut self, item: SyncWinItem) {
        self.win.push_back(item);
    }

    /// Mark the range `[start..=end]` acked, then pop the contiguous acked
    /// prefix. Returns the offset of the last popped item, or `None` if the
    /// head did not advance. Unknown `start` or `end` is a protocol
    /// corruption.
    pub fn update(
        &mut self,
        start: BinlogOffset,
        end: BinlogOffset,
    ) -> Result<Option<BinlogOffset>> {
        let mut start_pos = None;
        let mut end_pos = None;
        for (i, item) in self.win.iter().enumerate() {
            if start_pos.is_none() && item.offset == start {
                start_pos = Some(i);
            }
            if item.offset == end {
                end_pos = Some(i);
                break;
            }
        }
        let (start_pos, end_pos) = match (start_pos, end_pos) {
            (Some(s), Some(e)) if s <= e => (s, e),
            _ => {
                return Err(Error::Corruption(format!(
                    "ack range [{start}, {end}] not found in sync window (len {})",
                    self.win.len()
                )));
            }
        };

        for item in self.win.range_mut(start_pos..=end_pos) {
            item.acked = true;
        }

        let mut acked = None;
        while let Some(head) = self.win.front() {
            if !head.acked {
                break;
            }
            acked = Some(head.offset);
            self.win.pop_front();
        }
        Ok(acked)
    }

    /// Free slots left in the window
    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.win.len())
    }

    /// Items currently in flight
    pub fn len(&self) -> usize {
        self.win.len()
    }

    /// Check whether nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.win.is_empty()
    }
}
