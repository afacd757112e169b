//! Write-ahead logging for list mutations.
//!
//! The list core only needs a sink; everything after `log` returns is
//! the WAL manager's business. Two sinks are provided: an in-memory one
//! for tests and replay verification, and a file-backed one.

pub mod record;

use std::{
    io::SeekFrom,
    path::Path,
    sync::Mutex,
};

use crate::{
    codec::{Encodeable, SmallFile},
    error::SmallError,
    page::PageMemory,
    types::SmallResult,
};

pub use record::WalRecord;

/// A thread-safe sink for redo records. `log` must order the record
/// after the page mutation it describes; callers guarantee this by
/// logging while still holding the page write latch.
pub trait WalSink: Send + Sync {
    fn log(&self, record: &WalRecord) -> SmallResult;
}

/// Record sink backed by a plain vector. Used by tests and by the
/// replay checker.
pub struct MemWal {
    records: Mutex<Vec<WalRecord>>,
}

impl MemWal {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<WalRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

impl WalSink for MemWal {
    fn log(&self, record: &WalRecord) -> SmallResult {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Append-only file of encoded records.
pub struct FileWal {
    file: Mutex<SmallFile>,
}

impl FileWal {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, SmallError> {
        let mut file = SmallFile::new(path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Read every record back, for recovery. Stops cleanly at EOF.
    pub fn records(&self) -> Result<Vec<WalRecord>, SmallError> {
        let mut file = self.file.lock().unwrap();
        let size = file.get_size()?;
        file.seek(SeekFrom::Start(0))?;

        let mut records = Vec::new();
        while file.get_current_position()? < size {
            records.push(file.read::<WalRecord>()?);
        }

        file.seek(SeekFrom::End(0))?;
        Ok(records)
    }

    pub fn reset(&self) -> SmallResult {
        let mut file = self.file.lock().unwrap();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

impl WalSink for FileWal {
    fn log(&self, record: &WalRecord) -> SmallResult {
        let mut file = self.file.lock().unwrap();
        file.write_bytes(&record.encode())?;
        file.flush()
    }
}

/// Redo a record stream against a page memory.
///
/// Pages unknown to the store are materialized zeroed; the records that
/// created them in the original run re-create them here. Applying the
/// stream to a pre-mutation snapshot reproduces the mutated store byte
/// for byte.
pub fn replay(pm: &PageMemory, records: &[WalRecord]) -> SmallResult {
    for record in records {
        let slot = pm.page_or_alloc(record.target_page_id())?;
        let mut buf = slot.write();
        record.apply(&mut buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PageId, FLAG_IDX};

    #[test]
    fn test_file_wal_round_trip() {
        let path = std::env::temp_dir().join("small_freelist_wal_test.log");
        let _ = std::fs::remove_file(&path);

        let wal = FileWal::new(&path).unwrap();
        let node = PageId::new(FLAG_IDX, 0, 1);
        let records = vec![
            WalRecord::PagesListSetNext {
                cache_id: 9,
                page_id: node,
                next_id: PageId::new(FLAG_IDX, 0, 2),
            },
            WalRecord::Recycle {
                cache_id: 9,
                page_id: node,
                rotated_page_id: node.rotated(),
            },
        ];
        for r in &records {
            wal.log(r).unwrap();
        }

        assert_eq!(wal.records().unwrap(), records);

        wal.reset().unwrap();
        assert!(wal.records().unwrap().is_empty());

        let _ = std::fs::remove_file(&path);
    }
}
