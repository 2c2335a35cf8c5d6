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


// Atomic operations manager
// Opens atomic operations, keeps at most one open operation per thread and ends
// them against the shared durable log. Record slots and bonsai pointers freed by
// an operation become reusable only once the operation is committed.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::atomic_operations::metadata::BonsaiBucketPointer;
use crate::atomic_operations::operation::{AtomicOperation, UnitOutcome};
use crate::storage_engine::buffer_manager::{ReadCache, WriteCache};
use crate::storage_engine::lib::{StorageError, StorageResult};
use crate::storage_engine::wal::{DurableLog, LogSequenceNumber};

/// Marks the current thread as owning an open atomic operation until dropped
pub(crate) struct ThreadSlot {
    active: Arc<Mutex<HashSet<ThreadId>>>,
    thread: ThreadId,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        self.active.lock().remove(&self.thread);
    }
}

pub struct AtomicOperationsManager {
    read_cache: Arc<dyn ReadCache>,
    write_cache: Arc<dyn WriteCache>,
    log: Arc<dyn DurableLog>,
    next_unit_id: AtomicU64,
    active_threads: Arc<Mutex<HashSet<ThreadId>>>,
    reusable_bonsai_pointers: Mutex<VecDeque<BonsaiBucketPointer>>,
    reusable_record_positions: Mutex<HashMap<(u32, u64), BTreeSet<u32>>>,
    broken: AtomicBool,
}

impl AtomicOperationsManager {
    /// Unit ids continue after the highest id already present in `log`, so a
    /// unit of an earlier run is never confused with a new one on replay.
    pub fn new(read_cache: Arc<dyn ReadCache>, write_cache: Arc<dyn WriteCache>, log: Arc<dyn DurableLog>) -> StorageResult<Self> {
        let last_unit_id = log.read_from(LogSequenceNumber::default())?.iter().map(|(_, record)| record.operation_unit_id()).max().unwrap_or(0);
        debug!(next_unit_id = last_unit_id + 1, "atomic operations manager opened");

        Ok(Self {
            read_cache,
            write_cache,
            log,
            next_unit_id: AtomicU64::new(last_unit_id + 1),
            active_threads: Arc::new(Mutex::new(HashSet::new())),
            reusable_bonsai_pointers: Mutex::new(VecDeque::new()),
            reusable_record_positions: Mutex::new(HashMap::new()),
            broken: AtomicBool::new(false),
        })
    }

    /// Manager over a cache that serves both facades
    pub fn with_cache<C>(cache: Arc<C>, log: Arc<dyn DurableLog>) -> StorageResult<Self>
    where
        C: ReadCache + WriteCache + 'static,
    {
        let read_cache: Arc<dyn ReadCache> = cache.clone();
        let write_cache: Arc<dyn WriteCache> = cache;
        Self::new(read_cache, write_cache, log)
    }

    pub fn log(&self) -> &Arc<dyn DurableLog> {
        &self.log
    }

    /// Whether a logged unit failed to reach the page cache. The storage has to
    /// be restored from the log before it is used again.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Open an atomic operation on the current thread
    pub fn start_atomic_operation(&self) -> StorageResult<AtomicOperation> {
        if self.is_broken() {
            return Err(StorageError::InvalidOperation("storage must be restored from the write-ahead log".to_string()));
        }

        let thread = thread::current().id();
        if !self.active_threads.lock().insert(thread) {
            return Err(StorageError::Concurrency("an atomic operation is already started on this thread".to_string()));
        }
        let slot = ThreadSlot { active: Arc::clone(&self.active_threads), thread };

        let operation_unit_id = self.next_unit_id.fetch_add(1, Ordering::SeqCst);
        counter!("strata_atomic_operations_started", 1);
        trace!(operation_unit_id, "atomic operation started");

        Ok(AtomicOperation::new(operation_unit_id, Arc::clone(&self.read_cache), Arc::clone(&self.write_cache)).with_slot(slot))
    }

    /// Commit or roll back an operation. Returns the LSN of its unit end record.
    pub fn end_atomic_operation(&self, operation: AtomicOperation, outcome: UnitOutcome) -> StorageResult<LogSequenceNumber> {
        let freed = (outcome == UnitOutcome::Commit).then(|| (operation.deleted_bonsai_pointers().clone(), operation.deleted_record_positions().clone()));

        match operation.commit_changes(outcome, self.log.as_ref()) {
            Ok(end_lsn) => {
                if let Some((pointers, positions)) = freed {
                    self.reusable_bonsai_pointers.lock().extend(pointers);
                    let mut reusable = self.reusable_record_positions.lock();
                    for (key, slots) in positions.into_entries() {
                        reusable.entry(key).or_default().extend(slots);
                    }
                }
                Ok(end_lsn)
            }
            Err(e @ StorageError::ApplyFailed { .. }) => {
                error!(error = %e, "atomic operations manager is broken");
                self.broken.store(true, Ordering::Release);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Run `f` inside a new atomic operation, committing on `Ok` and rolling
    /// back on `Err`
    pub fn execute_in_atomic_operation<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut AtomicOperation) -> StorageResult<T>,
    {
        let mut operation = self.start_atomic_operation()?;
        match f(&mut operation) {
            Ok(value) => {
                self.end_atomic_operation(operation, UnitOutcome::Commit)?;
                Ok(value)
            }
            Err(e) => {
                let operation_unit_id = operation.operation_unit_id();
                if let Err(rollback_error) = self.end_atomic_operation(operation, UnitOutcome::Rollback) {
                    warn!(operation_unit_id, error = %rollback_error, "failed to log rollback of atomic operation");
                }
                Err(e)
            }
        }
    }

    /// Take a bonsai root pointer freed by a committed operation
    pub fn take_reusable_bonsai_pointer(&self) -> Option<BonsaiBucketPointer> {
        self.reusable_bonsai_pointers.lock().pop_front()
    }

    /// Take a record slot of the page freed by a committed operation
    pub fn take_reusable_record_position(&self, cluster_id: u32, page_index: u64) -> Option<u32> {
        let mut reusable = self.reusable_record_positions.lock();
        let slots = reusable.get_mut(&(cluster_id, page_index))?;
        let position = slots.pop_first();
        if slots.is_empty() {
            reusable.remove(&(cluster_id, page_index));
        }
        position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_engine::buffer_manager::MemoryPageCache;
    use crate::storage_engine::lib::StorageConfig;
    use crate::storage_engine::wal::{MemoryWal, MockDurableLog, WalRecord};

    fn manager() -> (AtomicOperationsManager, Arc<MemoryWal>) {
        let wal = Arc::new(MemoryWal::new());
        let cache = Arc::new(MemoryPageCache::new(64, None));
        (AtomicOperationsManager::with_cache(cache, wal.clone()).unwrap(), wal)
    }

    #[test]
    fn test_one_operation_per_thread() {
        let (manager, _) = manager();
        let first = manager.start_atomic_operation().unwrap();
        let first_id = first.operation_unit_id();
        assert!(matches!(manager.start_atomic_operation(), Err(StorageError::Concurrency(_))));

        // Another thread may open its own operation
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let other = manager.start_atomic_operation().unwrap();
                assert_ne!(other.operation_unit_id(), first_id);
            });
        });

        drop(first);
        let second = manager.start_atomic_operation().unwrap();
        manager.end_atomic_operation(second, UnitOutcome::Commit).unwrap();
        assert!(manager.start_atomic_operation().is_ok());
    }

    #[test]
    fn test_unit_ids_increase() {
        let (manager, _) = manager();
        let first = manager.start_atomic_operation().unwrap();
        let first_id = first.operation_unit_id();
        drop(first);
        let second = manager.start_atomic_operation().unwrap();
        assert!(second.operation_unit_id() > first_id);
    }

    #[test]
    fn test_unit_ids_continue_after_logged_units() {
        let wal = Arc::new(MemoryWal::new());
        let cache = Arc::new(MemoryPageCache::new(64, None));
        wal.log(&WalRecord::FileDeleted { operation_unit_id: 7, file_id: strata_common::FileId::compose(1, 0) }).unwrap();

        let manager = AtomicOperationsManager::with_cache(cache, wal).unwrap();
        assert_eq!(manager.start_atomic_operation().unwrap().operation_unit_id(), 8);
    }

    #[test]
    fn test_log_read_failure_fails_open() {
        let mut log = MockDurableLog::new();
        log.expect_read_from().returning(|_| Err(StorageError::Wal("unreadable".to_string())));
        let cache = Arc::new(MemoryPageCache::new(64, None));
        assert!(matches!(AtomicOperationsManager::with_cache(cache, Arc::new(log)), Err(StorageError::Wal(_))));
    }

    #[test]
    fn test_read_checksum_verification_follows_config() {
        for verify_checksums in [true, false] {
            let config = StorageConfig { page_size: 64, verify_checksums, ..Default::default() };
            let cache = Arc::new(MemoryPageCache::from_config(&config).unwrap());
            let manager = AtomicOperationsManager::with_cache(cache.clone(), Arc::new(MemoryWal::new())).unwrap();
            let file_id = manager
                .execute_in_atomic_operation(|operation| {
                    let file_id = operation.add_file("data")?;
                    let page = operation.add_page(file_id)?;
                    operation.entry_mut(&page)?.set_bytes(0, b"data")?;
                    Ok(file_id)
                })
                .unwrap();

            // Damage the page behind the cache's back
            cache.latch(file_id, 0).unwrap().unwrap().write().data[0] = 0xFF;

            let mut operation = manager.start_atomic_operation().unwrap();
            let result = operation.load_page_for_read(file_id, 0);
            if verify_checksums {
                assert!(matches!(result, Err(StorageError::Corruption(_))));
            } else {
                assert!(result.unwrap().is_some());
            }
        }
    }

    #[test]
    fn test_execute_rolls_back_on_error() {
        let (manager, wal) = manager();
        let result: StorageResult<()> = manager.execute_in_atomic_operation(|operation| {
            operation.add_file("scratch")?;
            Err(StorageError::InvalidOperation("abort".to_string()))
        });
        assert!(result.is_err());

        let records = wal.records();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].1, WalRecord::AtomicUnitEnd { rollback: true, .. }));
        assert!(manager.start_atomic_operation().is_ok());
    }

    #[test]
    fn test_freed_slots_published_after_commit_only() {
        let (manager, _) = manager();

        let mut operation = manager.start_atomic_operation().unwrap();
        operation.add_deleted_record_position(1, 5, 3);
        operation.add_deleted_bonsai_pointer(BonsaiBucketPointer::new(2, 64));
        assert_eq!(manager.take_reusable_record_position(1, 5), None);
        manager.end_atomic_operation(operation, UnitOutcome::Rollback).unwrap();
        assert_eq!(manager.take_reusable_record_position(1, 5), None);
        assert_eq!(manager.take_reusable_bonsai_pointer(), None);

        let mut operation = manager.start_atomic_operation().unwrap();
        operation.add_deleted_record_position(1, 5, 3);
        operation.add_deleted_record_position(1, 5, 1);
        operation.add_deleted_bonsai_pointer(BonsaiBucketPointer::new(2, 64));
        manager.end_atomic_operation(operation, UnitOutcome::Commit).unwrap();

        assert_eq!(manager.take_reusable_record_position(1, 5), Some(1));
        assert_eq!(manager.take_reusable_record_position(1, 5), Some(3));
        assert_eq!(manager.take_reusable_record_position(1, 5), None);
        assert_eq!(manager.take_reusable_bonsai_pointer(), Some(BonsaiBucketPointer::new(2, 64)));
    }

    #[test]
    fn test_log_failure_keeps_manager_usable() {
        let mut log = MockDurableLog::new();
        log.expect_read_from().returning(|_| Ok(Vec::new()));
        log.expect_end().returning(LogSequenceNumber::default);
        log.expect_log().returning(|_| Err(StorageError::Wal("disk full".to_string())));
        let cache = Arc::new(MemoryPageCache::new(64, None));
        let manager = AtomicOperationsManager::with_cache(cache.clone(), Arc::new(log)).unwrap();

        let result = manager.execute_in_atomic_operation(|operation| {
            let file_id = operation.add_file("idx")?;
            let page = operation.add_page(file_id)?;
            operation.entry_mut(&page)?.set_bytes(0, b"data")
        });
        assert!(matches!(result, Err(StorageError::Wal(_))));
        assert!(!manager.is_broken());
        assert!(!cache.exists("idx"));
        assert!(manager.start_atomic_operation().is_ok());
    }
}
