// Strata
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.


// WAL replay
// Restores committed atomic units into a page cache. A unit is applied only when
// its atomic unit end record is present and not marked as rolled back; units cut
// off by a crash are skipped. Replay is idempotent: a page already carrying the
// LSN of an update record (or a later one) is left alone.

use std::collections::HashMap;

use serde::Serialize;
use strata_common::FileId;
use tracing::{debug, info};

use crate::storage_engine::buffer_manager::{PageWriteGuard, ReadCache, WriteCache};
use crate::storage_engine::lib::{StorageError, StorageResult};
use crate::storage_engine::wal::{DurableLog, LogSequenceNumber, WalRecord};

/// Statistics of one restore run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    /// Records read from the log
    pub records: usize,
    pub units_applied: usize,
    pub units_rolled_back: usize,
    /// Units without an atomic unit end record
    pub units_incomplete: usize,
    pub files_created: usize,
    pub files_deleted: usize,
    pub pages_updated: usize,
    /// Page updates already present in the cache
    pub pages_skipped: usize,
    pub last_lsn: Option<LogSequenceNumber>,
}

/// Replays a durable log into a page cache
pub struct WalRestorer<'a> {
    read_cache: &'a dyn ReadCache,
    write_cache: &'a dyn WriteCache,
}

impl<'a> WalRestorer<'a> {
    pub fn new(read_cache: &'a dyn ReadCache, write_cache: &'a dyn WriteCache) -> Self {
        Self { read_cache, write_cache }
    }

    /// Replay every committed unit whose records start at or after `from`.
    ///
    /// Units are applied in the order of their atomic unit end records, which
    /// is the order in which they were committed. Records are expected in log
    /// order.
    pub fn restore(&self, log: &dyn DurableLog, from: LogSequenceNumber) -> StorageResult<RestoreSummary> {
        self.restore_records(log.read_from(from)?)
    }

    /// Replay records already read from a log, in log order
    pub fn restore_records(&self, records: Vec<(LogSequenceNumber, WalRecord)>) -> StorageResult<RestoreSummary> {
        let mut summary = RestoreSummary {
            records: records.len(),
            last_lsn: records.last().map(|(lsn, _)| *lsn),
            ..Default::default()
        };

        // A unit owns the records logged under its id since the previous end
        // record of that id, so a reused id never picks up records of another run
        let mut open: HashMap<u64, Vec<(LogSequenceNumber, WalRecord)>> = HashMap::new();
        let mut ended: Vec<(LogSequenceNumber, bool, Vec<(LogSequenceNumber, WalRecord)>)> = Vec::new();
        for (lsn, record) in records {
            let operation_unit_id = record.operation_unit_id();
            if let WalRecord::AtomicUnitEnd { rollback, .. } = &record {
                ended.push((lsn, *rollback, open.remove(&operation_unit_id).unwrap_or_default()));
            } else {
                open.entry(operation_unit_id).or_default().push((lsn, record));
            }
        }

        for (end_lsn, rollback, unit) in ended {
            if rollback {
                summary.units_rolled_back += 1;
                continue;
            }
            self.apply_unit(&unit, end_lsn, &mut summary)?;
            summary.units_applied += 1;
        }

        summary.units_incomplete = open.len();
        info!(
            records = summary.records,
            applied = summary.units_applied,
            rolled_back = summary.units_rolled_back,
            incomplete = summary.units_incomplete,
            pages = summary.pages_updated,
            "write-ahead log restored"
        );
        Ok(summary)
    }

    fn apply_unit(&self, unit: &[(LogSequenceNumber, WalRecord)], end_lsn: LogSequenceNumber, summary: &mut RestoreSummary) -> StorageResult<()> {
        for (lsn, record) in unit {
            match record {
                WalRecord::FileCreated { file_name, file_id, .. } => {
                    if !self.write_cache.exists_id(*file_id) {
                        self.read_cache.add_file(file_name, *file_id)?;
                        summary.files_created += 1;
                    }
                }
                WalRecord::FileDeleted { file_id, .. } => {
                    if self.write_cache.exists_id(*file_id) {
                        self.read_cache.delete_file(*file_id)?;
                        summary.files_deleted += 1;
                    }
                }
                WalRecord::UpdatePage { file_id, page_index, changes, .. } => {
                    if !self.write_cache.exists_id(*file_id) {
                        // The file is deleted by a later unit
                        debug!(%file_id, page_index, %lsn, "skipping update of missing file");
                        summary.pages_skipped += 1;
                        continue;
                    }
                    let mut page = self.page_for_update(*file_id, *page_index, *lsn)?;
                    if page.lsn() >= *lsn {
                        summary.pages_skipped += 1;
                        continue;
                    }
                    changes.apply_to(&mut page.data)?;
                    page.set_lsn(*lsn);
                    page.set_end_lsn(end_lsn);
                    summary.pages_updated += 1;
                }
                WalRecord::AtomicUnitEnd { .. } => {}
            }
        }
        Ok(())
    }

    fn page_for_update(&self, file_id: FileId, page_index: u64, lsn: LogSequenceNumber) -> StorageResult<PageWriteGuard> {
        if let Some(page) = self.read_cache.load_for_write(file_id, page_index, false, lsn)? {
            return Ok(page);
        }
        loop {
            let page = self.read_cache.allocate_new_page(file_id, lsn)?;
            if page.page_index() == page_index {
                return Ok(page);
            }
            if page.page_index() > page_index {
                return Err(StorageError::PageNotFound { file_id, page_index });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic_operations::metadata::OperationMetadata;
    use crate::storage_engine::buffer_manager::MemoryPageCache;
    use crate::storage_engine::changes::PageChanges;
    use crate::storage_engine::wal::MemoryWal;

    fn changes(offset: usize, bytes: &[u8]) -> PageChanges {
        let mut changes = PageChanges::new();
        changes.set_bytes(offset, bytes);
        changes
    }

    fn end(unit: u64, rollback: bool) -> WalRecord {
        WalRecord::AtomicUnitEnd { operation_unit_id: unit, rollback, metadata: OperationMetadata::new() }
    }

    #[test]
    fn test_restore_skips_rolled_back_and_incomplete_units() {
        let file_id = FileId::compose(1, 0);
        let wal = MemoryWal::new();
        wal.log(&WalRecord::FileCreated { operation_unit_id: 1, file_name: "idx".to_string(), file_id }).unwrap();
        wal.log(&WalRecord::UpdatePage { operation_unit_id: 1, file_id, page_index: 0, changes: changes(0, b"one"), initial_lsn: LogSequenceNumber::default() }).unwrap();
        wal.log(&end(1, false)).unwrap();
        wal.log(&WalRecord::UpdatePage { operation_unit_id: 2, file_id, page_index: 0, changes: changes(0, b"two"), initial_lsn: LogSequenceNumber::default() }).unwrap();
        wal.log(&end(2, true)).unwrap();
        wal.log(&WalRecord::UpdatePage { operation_unit_id: 3, file_id, page_index: 1, changes: changes(0, b"three"), initial_lsn: LogSequenceNumber::default() }).unwrap();

        let cache = MemoryPageCache::new(32, None);
        let summary = WalRestorer::new(&cache, &cache).restore(&wal, LogSequenceNumber::default()).unwrap();
        assert_eq!(summary.units_applied, 1);
        assert_eq!(summary.units_rolled_back, 1);
        assert_eq!(summary.units_incomplete, 1);
        assert_eq!(summary.files_created, 1);
        assert_eq!(summary.pages_updated, 1);

        assert_eq!(cache.filled_up_to(file_id).unwrap(), 1);
        let page = cache.load_for_read(file_id, 0, true).unwrap().unwrap();
        assert_eq!(&page.data[0..3], b"one");
    }

    #[test]
    fn test_reused_unit_id_binds_to_its_own_end_record() {
        let file_id = FileId::compose(1, 0);
        let wal = MemoryWal::new();
        wal.log(&WalRecord::FileCreated { operation_unit_id: 1, file_name: "idx".to_string(), file_id }).unwrap();
        wal.log(&WalRecord::UpdatePage { operation_unit_id: 1, file_id, page_index: 0, changes: changes(0, b"first"), initial_lsn: LogSequenceNumber::default() }).unwrap();
        wal.log(&end(1, false)).unwrap();
        // Same id again with no end record
        wal.log(&WalRecord::UpdatePage { operation_unit_id: 1, file_id, page_index: 0, changes: changes(0, b"crash"), initial_lsn: LogSequenceNumber::default() }).unwrap();

        let cache = MemoryPageCache::new(32, None);
        let summary = WalRestorer::new(&cache, &cache).restore(&wal, LogSequenceNumber::default()).unwrap();
        assert_eq!(summary.units_applied, 1);
        assert_eq!(summary.units_incomplete, 1);
        assert_eq!(summary.pages_updated, 1);
        let page = cache.load_for_read(file_id, 0, true).unwrap().unwrap();
        assert_eq!(&page.data[0..5], b"first");
    }

    #[test]
    fn test_update_larger_than_cache_page_fails() {
        let file_id = FileId::compose(1, 0);
        let wal = MemoryWal::new();
        wal.log(&WalRecord::FileCreated { operation_unit_id: 1, file_name: "idx".to_string(), file_id }).unwrap();
        wal.log(&WalRecord::UpdatePage { operation_unit_id: 1, file_id, page_index: 0, changes: changes(100, b"far"), initial_lsn: LogSequenceNumber::default() }).unwrap();
        wal.log(&end(1, false)).unwrap();

        let cache = MemoryPageCache::new(64, None);
        let result = WalRestorer::new(&cache, &cache).restore(&wal, LogSequenceNumber::default());
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_restore_is_idempotent() {
        let file_id = FileId::compose(1, 0);
        let wal = MemoryWal::new();
        wal.log(&WalRecord::FileCreated { operation_unit_id: 1, file_name: "idx".to_string(), file_id }).unwrap();
        wal.log(&WalRecord::UpdatePage { operation_unit_id: 1, file_id, page_index: 0, changes: changes(4, b"abc"), initial_lsn: LogSequenceNumber::default() }).unwrap();
        wal.log(&end(1, false)).unwrap();

        let cache = MemoryPageCache::new(32, None);
        let restorer = WalRestorer::new(&cache, &cache);
        restorer.restore(&wal, LogSequenceNumber::default()).unwrap();
        let second = restorer.restore(&wal, LogSequenceNumber::default()).unwrap();
        assert_eq!(second.files_created, 0);
        assert_eq!(second.pages_updated, 0);
        assert_eq!(second.pages_skipped, 1);
        assert_eq!(cache.filled_up_to(file_id).unwrap(), 1);
    }
}
