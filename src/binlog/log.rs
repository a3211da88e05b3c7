//! In-Memory Binlog
//!
//! A segmented, append-only record log. A record lives at the offset where
//! its write began; the log rolls to the next file index once a file has
//! grown past the configured roll size. The tip is the next write position,
//! which is also the read position a fully caught-up reader sits at.

use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::BinlogOffset;
use crate::error::{Error, Result};

#[derive(Debug)]
struct BinlogFile {
    /// Records keyed by their start offset within the file
    records: BTreeMap<u64, Vec<u8>>,
    /// Bytes written to this file so far
    len: u64,
}

impl BinlogFile {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            len: 0,
        }
    }
}

#[derive(Debug)]
struct BinlogInner {
    files: BTreeMap<u32, BinlogFile>,
    tip: BinlogOffset,
}

/// Append-only in-memory binlog for one partition
#[derive(Debug)]
pub struct Binlog {
    inner: Mutex<BinlogInner>,
    roll_bytes: u64,
}

impl Binlog {
    /// Create an empty binlog that rolls files after `roll_bytes` bytes
    pub fn new(roll_bytes: u64) -> Self {
        let mut files = BTreeMap::new();
        files.insert(0, BinlogFile::new());
        Self {
            inner: Mutex::new(BinlogInner {
                files,
                tip: BinlogOffset::default(),
            }),
            roll_bytes,
        }
    }

    /// Append a record, returning the read position after it
    pub fn append(&self, payload: &[u8]) -> BinlogOffset {
        let mut inner = self.inner.lock();
        let at = inner.tip;
        let file = inner
            .files
            .entry(at.file_index)
            .or_insert_with(BinlogFile::new);
        file.records.insert(at.byte_offset, payload.to_vec());
        file.len = at.byte_offset + payload.len() as u64;

        let next = if file.len >= self.roll_bytes {
            BinlogOffset::new(at.file_index + 1, 0)
        } else {
            BinlogOffset::new(at.file_index, file.len)
        };
        if next.file_index != at.file_index {
            inner.files.insert(next.file_index, BinlogFile::new());
        }
        inner.tip = next;
        next
    }

    /// The next write position (equals the read position of a caught-up reader)
    pub fn tip(&self) -> BinlogOffset {
        self.inner.lock().tip
    }

    /// Check whether `offset` is a valid read position: a record boundary or
    /// the tip itself
    pub fn is_record_boundary(&self, offset: BinlogOffset) -> bool {
        let inner = self.inner.lock();
        if offset == inner.tip {
            return true;
        }
        match inner.files.get(&offset.file_index) {
            Some(file) => file.records.contains_key(&offset.byte_offset),
            None => false,
        }
    }

    /// Read the record at `offset`, returning its payload and the read
    /// position after it. `Ok(None)` means the reader is at the tip.
    pub fn read_at(&self, offset: BinlogOffset) -> Result<Option<(Vec<u8>, BinlogOffset)>> {
        let inner = self.inner.lock();
        if offset == inner.tip {
            return Ok(None);
        }
        let file = inner.files.get(&offset.file_index).ok_or_else(|| {
            Error::Corruption(format!("binlog file {} does not exist", offset.file_index))
        })?;
        let payload = file.records.get(&offset.byte_offset).ok_or_else(|| {
            Error::Corruption(format!("no binlog record at offset {offset}"))
        })?;

        let end = offset.byte_offset + payload.len() as u64;
        let next = if end >= self.roll_bytes {
            BinlogOffset::new(offset.file_index + 1, 0)
        } else {
            BinlogOffset::new(offset.file_index, end)
        };
        Ok(Some((payload.clone(), next)))
    }

    /// Drop whole files up to and including `index`. Reading purged offsets
    /// fails with Corruption afterwards.
    pub fn purge_files(&self, index: u32) {
        let mut inner = self.inner.lock();
        let tip_file = inner.tip.file_index;
        inner
            .files
            .retain(|file_index, _| *file_index > index || *file_index == tip_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_tip() {
        let log = Binlog::new(1024);
        assert_eq!(log.tip(), BinlogOffset::default());

        let first = log.append(b"put k1 v1");
        assert_eq!(first, BinlogOffset::new(0, 9));
        let second = log.append(b"put k2 v2");
        assert_eq!(second, BinlogOffset::new(0, 18));
        assert_eq!(log.tip(), second);
    }

    #[test]
    fn test_read_at_boundaries() {
        let log = Binlog::new(1024);
        log.append(b"aaaa");
        log.append(b"bbbb");

        let (payload, next) = log.read_at(BinlogOffset::default()).unwrap().unwrap();
        assert_eq!(payload, b"aaaa");
        assert_eq!(next, BinlogOffset::new(0, 4));

        let (payload, next) = log.read_at(next).unwrap().unwrap();
        assert_eq!(payload, b"bbbb");
        assert_eq!(next, BinlogOffset::new(0, 8));

        // At the tip there is nothing left to read
        assert!(log.read_at(next).unwrap().is_none());

        // Mid-record positions are not readable
        assert!(log.read_at(BinlogOffset::new(0, 2)).is_err());
    }

    #[test]
    fn test_file_roll() {
        let log = Binlog::new(8);
        let next = log.append(b"12345678");
        assert_eq!(next, BinlogOffset::new(1, 0));

        let next = log.append(b"abc");
        assert_eq!(next, BinlogOffset::new(1, 3));

        let (payload, next) = log.read_at(BinlogOffset::default()).unwrap().unwrap();
        assert_eq!(payload, b"12345678");
        assert_eq!(next, BinlogOffset::new(1, 0));
    }

    #[test]
    fn test_purge_files() {
        let log = Binlog::new(4);
        for _ in 0..5 {
            log.append(b"xxxx");
        }
        assert_eq!(log.tip().file_index, 5);

        log.purge_files(2);
        assert!(log.read_at(BinlogOffset::new(1, 0)).is_err());
        assert!(log.read_at(BinlogOffset::new(3, 0)).unwrap().is_some());
    }
}
