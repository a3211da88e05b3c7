//! Binlog Readers
//!
//! A reader holds a cursor into one partition's binlog. Readers are reused
//! across replicas through the reader pool, so seeking rebinds the reader to
//! a (possibly different) binlog.

use std::sync::Arc;

use super::{Binlog, BinlogChip, BinlogOffset};
use crate::error::{Error, Result};

/// Cursor-based read access to a binlog
pub trait BinlogReader: Send + std::fmt::Debug {
    /// Bind the reader to `binlog` and position it at `offset`. Fails with
    /// Corruption if the offset is not a readable position.
    fn seek(&mut self, binlog: &Arc<Binlog>, offset: BinlogOffset) -> Result<()>;

    /// Read the record under the cursor and advance. `Ok(None)` means the
    /// cursor is at the tip; nothing to read is not an error.
    fn get(&mut self) -> Result<Option<BinlogChip>>;
}

/// The in-repo reader over the in-memory [`Binlog`]
#[derive(Default, Debug)]
pub struct LogReader {
    binlog: Option<Arc<Binlog>>,
    cursor: BinlogOffset,
}

impl LogReader {
    /// Create an unbound reader
    pub fn new() -> Self {
        Self::default()
    }
}

impl BinlogReader for LogReader {
    fn seek(&mut self, binlog: &Arc<Binlog>, offset: BinlogOffset) -> Result<()> {
        if !binlog.is_record_boundary(offset) {
            return Err(Error::Corruption(format!(
                "binlog offset {offset} is not a record boundary"
            )));
        }
        self.binlog = Some(Arc::clone(binlog));
        self.cursor = offset;
        Ok(())
    }

    fn get(&mut self) -> Result<Option<BinlogChip>> {
        let binlog = self
            .binlog
            .as_ref()
            .ok_or_else(|| Error::Internal("binlog reader not seeked".into()))?;
        match binlog.read_at(self.cursor)? {
            Some((payload, next)) => {
                self.cursor = next;
                Ok(Some(BinlogChip::new(next, payload)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_and_get() {
        let binlog = Arc::new(Binlog::new(1024));
        binlog.append(b"one");
        binlog.append(b"two");

        let mut reader = LogReader::new();
        reader.seek(&binlog, BinlogOffset::default()).unwrap();

        let chip = reader.get().unwrap().unwrap();
        assert_eq!(chip.payload, b"one");
        assert_eq!(chip.offset, BinlogOffset::new(0, 3));

        let chip = reader.get().unwrap().unwrap();
        assert_eq!(chip.payload, b"two");
        assert_eq!(chip.offset, BinlogOffset::new(0, 6));

        // Caught up with the writer
        assert!(reader.get().unwrap().is_none());

        // New records become visible without reseeking
        binlog.append(b"three");
        let chip = reader.get().unwrap().unwrap();
        assert_eq!(chip.payload, b"three");
    }

    #[test]
    fn test_seek_invalid_offset() {
        let binlog = Arc::new(Binlog::new(1024));
        binlog.append(b"one");

        let mut reader = LogReader::new();
        assert!(reader
            .seek(&binlog, BinlogOffset::new(0, 1))
            .unwrap_err()
            .is_corruption());
        assert!(reader
            .seek(&binlog, BinlogOffset::new(7, 0))
            .unwrap_err()
            .is_corruption());
    }

    #[test]
    fn test_get_before_seek() {
        let mut reader = LogReader::new();
        assert!(reader.get().is_err());
    }
}
