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


// Atomic operation module
// An atomic operation buffers page and file changes of one unit of work. Nothing
// it does is visible to other operations until `commit_changes` has written the
// buffer to the durable log and then applied it to the page cache.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use metrics::counter;
use strata_common::{FileId, PageIndex, StorageId};
use tracing::{debug, error, trace, warn};

use crate::atomic_operations::file_changes::{CacheEntryChanges, FileChanges, FileLifecycle, PageExtent, PageHandle};
use crate::atomic_operations::manager::ThreadSlot;
use crate::atomic_operations::metadata::{BonsaiBucketPointer, DeletedRecordPositions, OperationMetadata};
use crate::storage_engine::buffer_manager::{ReadCache, WriteCache};
use crate::storage_engine::lib::{StorageError, StorageResult, file_deleted_error};
use crate::storage_engine::wal::{DurableLog, LogSequenceNumber, WalRecord};

const TRUNCATE_WARNING: &str = "truncating a file inside an atomic operation can not be rolled back and the file may be restored incorrectly after a crash";

/// How an atomic operation ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Log and apply the buffered changes
    Commit,
    /// Log the end of the unit as rolled back and discard the buffer
    Rollback,
}

/// A unit of work over the page cache
pub struct AtomicOperation {
    operation_unit_id: u64,
    storage_id: Option<StorageId>,
    read_cache: Arc<dyn ReadCache>,
    write_cache: Arc<dyn WriteCache>,

    file_changes: BTreeMap<FileId, FileChanges>,
    new_file_names: HashMap<String, FileId>,
    deleted_files: BTreeSet<FileId>,
    deleted_file_names: HashMap<String, FileId>,

    metadata: OperationMetadata,
    deleted_bonsai_pointers: BTreeSet<BonsaiBucketPointer>,
    deleted_record_positions: DeletedRecordPositions,
    locked_objects: HashSet<String>,
    component_operations: i32,

    /// Released when the operation is committed or dropped
    _thread_slot: Option<ThreadSlot>,
}

impl AtomicOperation {
    pub fn new(operation_unit_id: u64, read_cache: Arc<dyn ReadCache>, write_cache: Arc<dyn WriteCache>) -> Self {
        Self {
            operation_unit_id,
            storage_id: write_cache.storage_id(),
            read_cache,
            write_cache,
            file_changes: BTreeMap::new(),
            new_file_names: HashMap::new(),
            deleted_files: BTreeSet::new(),
            deleted_file_names: HashMap::new(),
            metadata: OperationMetadata::new(),
            deleted_bonsai_pointers: BTreeSet::new(),
            deleted_record_positions: DeletedRecordPositions::default(),
            locked_objects: HashSet::new(),
            component_operations: 0,
            _thread_slot: None,
        }
    }

    pub(crate) fn with_slot(mut self, slot: ThreadSlot) -> Self {
        self._thread_slot = Some(slot);
        self
    }

    pub fn operation_unit_id(&self) -> u64 {
        self.operation_unit_id
    }

    pub fn storage_id(&self) -> Option<StorageId> {
        self.storage_id
    }

    /// Promote a local file id to a full id of this storage
    fn compatible(&self, file_id: FileId) -> FileId {
        file_id.with_storage(self.storage_id)
    }

    fn check_not_deleted(&self, file_id: FileId) -> StorageResult<()> {
        if self.deleted_files.contains(&file_id) {
            return Err(file_deleted_error(file_id));
        }
        Ok(())
    }

    /// Change record of a file, created on first touch of an existing file
    fn file_record(&mut self, file_id: FileId) -> StorageResult<&mut FileChanges> {
        self.check_not_deleted(file_id)?;
        if !self.file_changes.contains_key(&file_id) && !self.write_cache.exists_id(file_id) {
            return Err(StorageError::FileNotFound(file_id.to_string()));
        }
        Ok(self.file_changes.entry(file_id).or_insert_with(FileChanges::existing))
    }

    /// Changes staged for a file, if the operation touched it
    pub fn file_changes(&self, file_id: FileId) -> Option<&FileChanges> {
        self.file_changes.get(&self.compatible(file_id))
    }

    /// Load a page for reading.
    ///
    /// Returns `None` when the page does not exist from the point of view of
    /// this operation.
    pub fn load_page_for_read(&mut self, file_id: FileId, page_index: PageIndex) -> StorageResult<Option<PageHandle>> {
        let file_id = self.compatible(file_id);
        let verify_checksum = self.write_cache.verify_checksums();
        self.load_page(file_id, page_index, verify_checksum)
    }

    /// Load a page for writing. Writes are staged in the operation; later loads
    /// of the same page observe them.
    pub fn load_page_for_write(&mut self, file_id: FileId, page_index: PageIndex, page_count: usize, verify_checksum: bool) -> StorageResult<Option<PageHandle>> {
        debug_assert!(page_count > 0);
        let file_id = self.compatible(file_id);
        self.load_page(file_id, page_index, verify_checksum)
    }

    fn load_page(&mut self, file_id: FileId, page_index: PageIndex, verify_checksum: bool) -> StorageResult<Option<PageHandle>> {
        let operation_unit_id = self.operation_unit_id;
        let read_cache = Arc::clone(&self.read_cache);
        let page_size = self.write_cache.page_size();
        let handle = PageHandle { file_id, page_index };

        let record = self.file_record(file_id)?;
        if record.is_new_file() {
            return Ok(record.pages.contains_key(&page_index).then_some(handle));
        }
        if !record.extent.covers(page_index) {
            return Ok(None);
        }

        if let Some(page) = record.pages.get_mut(&page_index) {
            if !page.is_new() {
                // Re-pin the cache page. The old pin goes first so a page is never latched twice.
                page.delegate = None;
                let delegate = read_cache.load_for_read(file_id, page_index, page.verify_checksum)?.ok_or(StorageError::PageNotFound { file_id, page_index })?;
                page.delegate = Some(delegate);
            }
            return Ok(Some(handle));
        }

        let Some(delegate) = read_cache.load_for_read(file_id, page_index, verify_checksum)? else {
            return Ok(None);
        };
        trace!(operation_unit_id, %file_id, page_index, "page added to atomic operation");
        record.pages.insert(page_index, CacheEntryChanges::loaded(delegate, page_size, verify_checksum));
        Ok(Some(handle))
    }

    /// Append a page at the end of the file
    pub fn add_page(&mut self, file_id: FileId) -> StorageResult<PageHandle> {
        let file_id = self.compatible(file_id);
        let page_size = self.write_cache.page_size();
        let page_index = self.filled_up_to_compatible(file_id)?;

        let record = self.file_record(file_id)?;
        debug_assert!(!record.pages.contains_key(&page_index));
        record.pages.insert(page_index, CacheEntryChanges::new_page(file_id, page_index, page_size));
        record.extent = PageExtent::Local(Some(page_index));
        Ok(PageHandle { file_id, page_index })
    }

    /// Staged view of a loaded page
    pub fn entry(&self, handle: &PageHandle) -> StorageResult<&CacheEntryChanges> {
        self.check_not_deleted(handle.file_id)?;
        self.file_changes
            .get(&handle.file_id)
            .and_then(|record| record.pages.get(&handle.page_index))
            .ok_or_else(|| not_loaded(handle))
    }

    pub fn entry_mut(&mut self, handle: &PageHandle) -> StorageResult<&mut CacheEntryChanges> {
        self.check_not_deleted(handle.file_id)?;
        self.file_changes
            .get_mut(&handle.file_id)
            .and_then(|record| record.pages.get_mut(&handle.page_index))
            .ok_or_else(|| not_loaded(handle))
    }

    pub fn release_page_from_read(&mut self, handle: PageHandle) -> StorageResult<()> {
        self.release_page_from_write(handle)
    }

    /// Drop the cache pin of a page. Staged changes are kept.
    pub fn release_page_from_write(&mut self, handle: PageHandle) -> StorageResult<()> {
        self.check_not_deleted(handle.file_id)?;
        if let Some(page) = self.file_changes.get_mut(&handle.file_id).and_then(|record| record.pages.get_mut(&handle.page_index)) {
            page.delegate = None;
        }
        Ok(())
    }

    /// Number of pages of the file as seen by this operation
    pub fn filled_up_to(&mut self, file_id: FileId) -> StorageResult<PageIndex> {
        let file_id = self.compatible(file_id);
        self.filled_up_to_compatible(file_id)
    }

    fn filled_up_to_compatible(&mut self, file_id: FileId) -> StorageResult<PageIndex> {
        let record = self.file_record(file_id)?;
        match record.extent.local_len() {
            Some(len) => Ok(len),
            None => self.write_cache.filled_up_to(file_id),
        }
    }

    /// Create a file. A name deleted earlier in this operation gets its old id back.
    pub fn add_file(&mut self, file_name: &str) -> StorageResult<FileId> {
        if self.new_file_names.contains_key(file_name) {
            return Err(StorageError::IllegalFileState(format!("File with name {} already exists", file_name)));
        }

        let (file_id, record) = match self.deleted_file_names.remove(file_name) {
            Some(file_id) => {
                self.deleted_files.remove(&file_id);
                (file_id, FileChanges::recreated(file_name.to_string()))
            }
            None => (self.write_cache.book_file_id(file_name)?, FileChanges::created(file_name.to_string())),
        };

        self.new_file_names.insert(file_name.to_string(), file_id);
        self.file_changes.insert(file_id, record);
        trace!(operation_unit_id = self.operation_unit_id, %file_id, file_name, "file added to atomic operation");
        Ok(file_id)
    }

    /// Resolve a file by name, preferring files created in this operation
    pub fn load_file(&mut self, file_name: &str) -> StorageResult<FileId> {
        if let Some(file_id) = self.new_file_names.get(file_name) {
            return Ok(*file_id);
        }
        if let Some(file_id) = self.deleted_file_names.get(file_name) {
            return Err(file_deleted_error(*file_id));
        }

        let file_id = self.write_cache.load_file(file_name)?;
        self.file_changes.entry(file_id).or_insert_with(FileChanges::existing);
        Ok(file_id)
    }

    /// Delete a file. A file created in this operation leaves no trace.
    pub fn delete_file(&mut self, file_id: FileId) -> StorageResult<()> {
        let file_id = self.compatible(file_id);

        let name = match self.file_changes.remove(&file_id) {
            Some(record) => match record.lifecycle {
                FileLifecycle::Created { name } => {
                    self.new_file_names.remove(&name);
                    return Ok(());
                }
                FileLifecycle::Recreated { name } => {
                    self.new_file_names.remove(&name);
                    Some(name)
                }
                FileLifecycle::Existing | FileLifecycle::Truncated => self.write_cache.file_name_by_id(file_id),
            },
            None => {
                if self.deleted_files.contains(&file_id) {
                    return Ok(());
                }
                if !self.write_cache.exists_id(file_id) {
                    return Err(StorageError::FileNotFound(file_id.to_string()));
                }
                self.write_cache.file_name_by_id(file_id)
            }
        };

        self.deleted_files.insert(file_id);
        if let Some(name) = name {
            self.deleted_file_names.insert(name, file_id);
        }
        Ok(())
    }

    /// Drop every page of the file.
    ///
    /// For a file that existed before the operation the truncation is applied
    /// to the cache on commit; it is not logged and can not be rolled back.
    pub fn truncate_file(&mut self, file_id: FileId) -> StorageResult<()> {
        let file_id = self.compatible(file_id);
        self.file_record(file_id)?.truncate();
        Ok(())
    }

    pub fn is_file_exists(&self, file_name: &str) -> bool {
        if self.new_file_names.contains_key(file_name) {
            return true;
        }
        if self.deleted_file_names.contains_key(file_name) {
            return false;
        }
        self.write_cache.exists(file_name)
    }

    pub fn file_id_by_name(&self, file_name: &str) -> Option<FileId> {
        if let Some(file_id) = self.new_file_names.get(file_name) {
            return Some(*file_id);
        }
        if self.deleted_file_names.contains_key(file_name) {
            return None;
        }
        self.write_cache.file_id_by_name(file_name)
    }

    pub fn file_name_by_id(&self, file_id: FileId) -> StorageResult<Option<String>> {
        let file_id = self.compatible(file_id);
        if let Some(name) = self.file_changes.get(&file_id).and_then(FileChanges::name) {
            return Ok(Some(name.to_string()));
        }
        self.check_not_deleted(file_id)?;
        Ok(self.write_cache.file_name_by_id(file_id))
    }

    /// Attach metadata to the atomic unit end record, replacing a value with the same key
    pub fn add_metadata(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.metadata.insert(key, value);
    }

    pub fn metadata(&self, key: &str) -> Option<&[u8]> {
        self.metadata.get(key)
    }

    pub fn add_deleted_bonsai_pointer(&mut self, pointer: BonsaiBucketPointer) {
        self.deleted_bonsai_pointers.insert(pointer);
    }

    pub fn deleted_bonsai_pointers(&self) -> &BTreeSet<BonsaiBucketPointer> {
        &self.deleted_bonsai_pointers
    }

    pub fn add_deleted_record_position(&mut self, cluster_id: u32, page_index: u64, record_position: u32) {
        self.deleted_record_positions.add(cluster_id, page_index, record_position);
    }

    /// Record positions of a page freed by this operation
    pub fn booked_record_positions(&self, cluster_id: u32, page_index: u64) -> HashSet<u32> {
        self.deleted_record_positions.get(cluster_id, page_index).cloned().unwrap_or_default()
    }

    pub fn deleted_record_positions(&self) -> &DeletedRecordPositions {
        &self.deleted_record_positions
    }

    pub fn increment_component_operations(&mut self) {
        self.component_operations += 1;
    }

    pub fn decrement_component_operations(&mut self) {
        self.component_operations -= 1;
    }

    pub fn component_operations(&self) -> i32 {
        self.component_operations
    }

    pub fn add_locked_object(&mut self, locked_object: impl Into<String>) {
        self.locked_objects.insert(locked_object.into());
    }

    pub fn contains_in_locked_objects(&self, object: &str) -> bool {
        self.locked_objects.contains(object)
    }

    pub fn locked_objects(&self) -> impl Iterator<Item = &str> {
        self.locked_objects.iter().map(String::as_str)
    }

    /// Ends the atomic operation.
    ///
    /// On `Commit` the buffer is first written to `log`, ending with an atomic
    /// unit end record; a log failure leaves the page cache untouched. The
    /// changes are then applied to the cache. A failure at that point yields
    /// [`StorageError::ApplyFailed`]: the log already holds the unit and the
    /// cache must be rebuilt from it.
    ///
    /// On `Rollback` only a rolled back unit end record is logged.
    ///
    /// Returns the LSN of the atomic unit end record.
    pub fn commit_changes(mut self, outcome: UnitOutcome, log: &dyn DurableLog) -> StorageResult<LogSequenceNumber> {
        // Cache pins go first: applying takes write latches on the same pages
        for record in self.file_changes.values_mut() {
            record.unpin_all();
        }

        if outcome == UnitOutcome::Rollback {
            let end_lsn = log.log(&WalRecord::AtomicUnitEnd {
                operation_unit_id: self.operation_unit_id,
                rollback: true,
                metadata: self.metadata.clone(),
            })?;
            counter!("strata_atomic_operations_rolled_back", 1);
            debug!(operation_unit_id = self.operation_unit_id, %end_lsn, "atomic operation rolled back");
            return Ok(end_lsn);
        }

        let (start_lsn, end_lsn) = self.log_changes(log)?;

        match self.apply_changes(start_lsn, end_lsn) {
            Ok(pages) => {
                counter!("strata_atomic_operations_committed", 1);
                counter!("strata_pages_applied", pages as u64);
                debug!(operation_unit_id = self.operation_unit_id, %start_lsn, %end_lsn, pages, "atomic operation committed");
                Ok(end_lsn)
            }
            Err(e) => {
                error!(operation_unit_id = self.operation_unit_id, %end_lsn, error = %e, "failed to apply logged atomic operation");
                Err(StorageError::ApplyFailed { end_lsn, source: Box::new(e) })
            }
        }
    }

    /// Writes the buffer to the log and returns the log end before the first
    /// record together with the LSN of the unit end record
    fn log_changes(&mut self, log: &dyn DurableLog) -> StorageResult<(LogSequenceNumber, LogSequenceNumber)> {
        let operation_unit_id = self.operation_unit_id;
        let start_lsn = log.end();

        for file_id in &self.deleted_files {
            log.log(&WalRecord::FileDeleted { operation_unit_id, file_id: *file_id })?;
        }

        for (file_id, record) in self.file_changes.iter_mut() {
            let file_id = *file_id;
            match &record.lifecycle {
                FileLifecycle::Created { name } => {
                    log.log(&WalRecord::FileCreated { operation_unit_id, file_name: name.clone(), file_id })?;
                }
                FileLifecycle::Recreated { name } => {
                    log.log(&WalRecord::FileDeleted { operation_unit_id, file_id })?;
                    log.log(&WalRecord::FileCreated { operation_unit_id, file_name: name.clone(), file_id })?;
                }
                FileLifecycle::Truncated => warn!(operation_unit_id, %file_id, "{}", TRUNCATE_WARNING),
                FileLifecycle::Existing => {}
            }

            record.pages.retain(|_, page| page.has_changes());
            for (page_index, page) in record.pages.iter_mut() {
                let lsn = log.log(&WalRecord::UpdatePage {
                    operation_unit_id,
                    file_id,
                    page_index: *page_index,
                    changes: page.changes.clone(),
                    initial_lsn: page.initial_lsn(),
                })?;
                page.change_lsn = Some(lsn);
            }
        }

        let end_lsn = log.log(&WalRecord::AtomicUnitEnd {
            operation_unit_id,
            rollback: false,
            metadata: self.metadata.clone(),
        })?;
        Ok((start_lsn, end_lsn))
    }

    /// Makes logged changes visible in the page cache and returns the number of
    /// pages written
    fn apply_changes(&self, start_lsn: LogSequenceNumber, end_lsn: LogSequenceNumber) -> StorageResult<usize> {
        for file_id in &self.deleted_files {
            self.read_cache.delete_file(*file_id)?;
        }

        let mut pages = 0;
        for (file_id, record) in &self.file_changes {
            let file_id = *file_id;
            match &record.lifecycle {
                FileLifecycle::Created { name } => self.read_cache.add_file(name, file_id)?,
                FileLifecycle::Recreated { name } => {
                    self.read_cache.delete_file(file_id)?;
                    self.read_cache.add_file(name, file_id)?;
                }
                FileLifecycle::Truncated => {
                    warn!(operation_unit_id = self.operation_unit_id, %file_id, "{}", TRUNCATE_WARNING);
                    self.read_cache.truncate_file(file_id)?;
                }
                FileLifecycle::Existing => {}
            }

            for (page_index, page) in &record.pages {
                let page_index = *page_index;
                let change_lsn = page.change_lsn().ok_or_else(|| StorageError::InvalidOperation(format!("page {} of file {} was not logged", page_index, file_id)))?;

                let mut cache_page = match self.read_cache.load_for_write(file_id, page_index, page.verify_checksum, start_lsn)? {
                    Some(cache_page) => cache_page,
                    None if page.is_new() => loop {
                        let allocated = self.read_cache.allocate_new_page(file_id, start_lsn)?;
                        if allocated.page_index() == page_index {
                            break allocated;
                        }
                        if allocated.page_index() > page_index {
                            return Err(StorageError::PageNotFound { file_id, page_index });
                        }
                    },
                    None => return Err(StorageError::PageNotFound { file_id, page_index }),
                };

                cache_page.set_end_lsn(end_lsn);
                page.changes.apply_to(&mut cache_page.data)?;
                cache_page.set_lsn(change_lsn);
                pages += 1;
            }
        }
        Ok(pages)
    }
}

fn not_loaded(handle: &PageHandle) -> StorageError {
    StorageError::InvalidOperation(format!("page {} of file {} is not loaded in the atomic operation", handle.page_index, handle.file_id))
}

impl std::fmt::Debug for AtomicOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicOperation")
            .field("operation_unit_id", &self.operation_unit_id)
            .field("storage_id", &self.storage_id)
            .field("files", &self.file_changes.len())
            .field("deleted_files", &self.deleted_files)
            .field("component_operations", &self.component_operations)
            .finish()
    }
}
