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


// Buffer management module
// This module defines the page cache facades used by atomic operations and an
// in-memory cache implementing both. Cached pages are handed out as latched
// guards: holding a guard pins the page, dropping it releases latch and pin.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use strata_common::{FileId, PageIndex, StorageId};
use tracing::{debug, trace};

use crate::storage_engine::lib::{StorageConfig, StorageError, StorageResult};
use crate::storage_engine::page::PageFrame;
use crate::storage_engine::wal::LogSequenceNumber;

/// A page latch shared between the cache and the guards it hands out
pub type PageLatch = Arc<RwLock<PageFrame>>;

/// Page cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of page loads
    pub loads: AtomicU64,
    /// Number of allocated pages
    pub allocations: AtomicU64,
    /// Number of pages currently pinned by guards
    pinned: AtomicUsize,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_loads(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_allocations(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pinned_pages(&self) -> usize {
        self.pinned.load(Ordering::Acquire)
    }

    fn pin(&self) {
        self.pinned.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        self.pinned.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A page pinned and latched for reading
pub struct PageReadGuard {
    file_id: FileId,
    page_index: PageIndex,
    guard: ArcRwLockReadGuard<RawRwLock, PageFrame>,
    stats: Arc<CacheStats>,
}

impl PageReadGuard {
    fn new(file_id: FileId, page_index: PageIndex, latch: &PageLatch, stats: Arc<CacheStats>) -> Self {
        let guard = latch.read_arc();
        stats.pin();
        Self { file_id, page_index, guard, stats }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn page_index(&self) -> PageIndex {
        self.page_index
    }
}

impl Deref for PageReadGuard {
    type Target = PageFrame;

    fn deref(&self) -> &PageFrame {
        &self.guard
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        self.stats.unpin();
    }
}

/// A page pinned and latched exclusively. The checksum is refreshed on release.
pub struct PageWriteGuard {
    file_id: FileId,
    page_index: PageIndex,
    guard: ArcRwLockWriteGuard<RawRwLock, PageFrame>,
    stats: Arc<CacheStats>,
}

impl PageWriteGuard {
    fn new(file_id: FileId, page_index: PageIndex, latch: &PageLatch, stats: Arc<CacheStats>) -> Self {
        let guard = latch.write_arc();
        stats.pin();
        Self { file_id, page_index, guard, stats }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn page_index(&self) -> PageIndex {
        self.page_index
    }
}

impl Deref for PageWriteGuard {
    type Target = PageFrame;

    fn deref(&self) -> &PageFrame {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut PageFrame {
        &mut self.guard
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        self.guard.update_checksum();
        self.stats.unpin();
    }
}

/// Page-level access to the shared cache
pub trait ReadCache: Send + Sync {
    /// Pin a page for reading; `None` when the page is beyond the end of the file
    fn load_for_read(&self, file_id: FileId, page_index: PageIndex, verify_checksum: bool) -> StorageResult<Option<PageReadGuard>>;

    /// Pin a page for writing, marking it dirty from `start_lsn`
    fn load_for_write(&self, file_id: FileId, page_index: PageIndex, verify_checksum: bool, start_lsn: LogSequenceNumber) -> StorageResult<Option<PageWriteGuard>>;

    /// Append a zeroed page to the file and pin it for writing
    fn allocate_new_page(&self, file_id: FileId, start_lsn: LogSequenceNumber) -> StorageResult<PageWriteGuard>;

    /// Register a file under an id previously booked for its name
    fn add_file(&self, file_name: &str, file_id: FileId) -> StorageResult<()>;

    fn delete_file(&self, file_id: FileId) -> StorageResult<()>;

    /// Drop every page of the file
    fn truncate_file(&self, file_id: FileId) -> StorageResult<()>;
}

/// File namespace and sizing side of the shared cache
pub trait WriteCache: Send + Sync {
    /// Number of pages in the file
    fn filled_up_to(&self, file_id: FileId) -> StorageResult<PageIndex>;

    /// Reserve an id for a file that will be added later. Booking the same name
    /// again returns the same id until the file is added.
    fn book_file_id(&self, file_name: &str) -> StorageResult<FileId>;

    /// Resolve the id of an existing file
    fn load_file(&self, file_name: &str) -> StorageResult<FileId>;

    fn file_id_by_name(&self, file_name: &str) -> Option<FileId>;

    fn file_name_by_id(&self, file_id: FileId) -> Option<String>;

    /// Name of the file as the backing store knows it
    fn native_file_name_by_id(&self, file_id: FileId) -> Option<String>;

    fn exists(&self, file_name: &str) -> bool;

    fn exists_id(&self, file_id: FileId) -> bool;

    fn page_size(&self) -> usize;

    /// Storage id composed into the file ids of this cache
    fn storage_id(&self) -> Option<StorageId>;

    /// Whether pages read by atomic operations verify their checksum
    fn verify_checksums(&self) -> bool;
}

struct MemoryFile {
    name: String,
    pages: Vec<PageLatch>,
}

#[derive(Default)]
struct Namespace {
    files: HashMap<FileId, MemoryFile>,
    ids_by_name: HashMap<String, FileId>,
    booked: HashMap<String, FileId>,
    next_local_id: u32,
}

/// Memory-only page cache. Pages are never evicted.
pub struct MemoryPageCache {
    page_size: usize,
    storage_id: Option<StorageId>,
    verify_checksums: bool,
    namespace: RwLock<Namespace>,
    stats: Arc<CacheStats>,
}

impl MemoryPageCache {
    pub fn new(page_size: usize, storage_id: Option<StorageId>) -> Self {
        Self {
            page_size,
            storage_id,
            verify_checksums: true,
            namespace: RwLock::new(Namespace { next_local_id: 1, ..Default::default() }),
            stats: Arc::new(CacheStats::new()),
        }
    }

    pub fn from_config(config: &StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        let mut cache = Self::new(config.page_size, config.storage_id);
        cache.verify_checksums = config.verify_checksums;
        Ok(cache)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Files currently registered, as `(id, name, page count)` sorted by id
    pub fn files(&self) -> Vec<(FileId, String, PageIndex)> {
        let namespace = self.namespace.read();
        let mut files: Vec<_> = namespace.files.iter().map(|(id, file)| (*id, file.name.clone(), file.pages.len() as PageIndex)).collect();
        files.sort_by_key(|(id, _, _)| *id);
        files
    }

    pub(crate) fn latch(&self, file_id: FileId, page_index: PageIndex) -> StorageResult<Option<PageLatch>> {
        let namespace = self.namespace.read();
        let file = namespace.files.get(&file_id).ok_or_else(|| StorageError::FileNotFound(file_id.to_string()))?;
        let latch = usize::try_from(page_index).ok().and_then(|index| file.pages.get(index)).cloned();
        Ok(latch)
    }
}

impl ReadCache for MemoryPageCache {
    fn load_for_read(&self, file_id: FileId, page_index: PageIndex, verify_checksum: bool) -> StorageResult<Option<PageReadGuard>> {
        // The namespace lock is released before blocking on the page latch
        let Some(latch) = self.latch(file_id, page_index)? else {
            return Ok(None);
        };
        self.stats.inc_loads();
        trace!(%file_id, page_index, "load page for read");

        let guard = PageReadGuard::new(file_id, page_index, &latch, Arc::clone(&self.stats));
        if verify_checksum && !guard.verify_checksum() {
            return Err(StorageError::Corruption(format!("Checksum mismatch for page {} of file {}", page_index, file_id)));
        }
        Ok(Some(guard))
    }

    fn load_for_write(&self, file_id: FileId, page_index: PageIndex, verify_checksum: bool, start_lsn: LogSequenceNumber) -> StorageResult<Option<PageWriteGuard>> {
        let Some(latch) = self.latch(file_id, page_index)? else {
            return Ok(None);
        };
        self.stats.inc_loads();
        trace!(%file_id, page_index, "load page for write");

        let mut guard = PageWriteGuard::new(file_id, page_index, &latch, Arc::clone(&self.stats));
        if verify_checksum && !guard.verify_checksum() {
            return Err(StorageError::Corruption(format!("Checksum mismatch for page {} of file {}", page_index, file_id)));
        }
        guard.mark_dirty_from(start_lsn);
        Ok(Some(guard))
    }

    fn allocate_new_page(&self, file_id: FileId, start_lsn: LogSequenceNumber) -> StorageResult<PageWriteGuard> {
        let (page_index, latch) = {
            let mut namespace = self.namespace.write();
            let file = namespace.files.get_mut(&file_id).ok_or_else(|| StorageError::FileNotFound(file_id.to_string()))?;
            let latch: PageLatch = Arc::new(RwLock::new(PageFrame::new(self.page_size)));
            file.pages.push(Arc::clone(&latch));
            (file.pages.len() as PageIndex - 1, latch)
        };
        self.stats.inc_allocations();
        trace!(%file_id, page_index, "allocated page");

        let mut guard = PageWriteGuard::new(file_id, page_index, &latch, Arc::clone(&self.stats));
        guard.mark_dirty_from(start_lsn);
        Ok(guard)
    }

    fn add_file(&self, file_name: &str, file_id: FileId) -> StorageResult<()> {
        let mut namespace = self.namespace.write();
        if namespace.ids_by_name.contains_key(file_name) {
            return Err(StorageError::IllegalFileState(format!("File with name {} already exists", file_name)));
        }
        if namespace.files.contains_key(&file_id) {
            return Err(StorageError::IllegalFileState(format!("File with id {} already exists", file_id)));
        }

        namespace.booked.remove(file_name);
        namespace.next_local_id = namespace.next_local_id.max(file_id.local_id().saturating_add(1));
        namespace.ids_by_name.insert(file_name.to_string(), file_id);
        namespace.files.insert(file_id, MemoryFile { name: file_name.to_string(), pages: Vec::new() });
        debug!(%file_id, file_name, "file added");
        Ok(())
    }

    fn delete_file(&self, file_id: FileId) -> StorageResult<()> {
        let mut namespace = self.namespace.write();
        let file = namespace.files.remove(&file_id).ok_or_else(|| StorageError::FileNotFound(file_id.to_string()))?;
        namespace.ids_by_name.remove(&file.name);
        debug!(%file_id, file_name = %file.name, "file deleted");
        Ok(())
    }

    fn truncate_file(&self, file_id: FileId) -> StorageResult<()> {
        let mut namespace = self.namespace.write();
        let file = namespace.files.get_mut(&file_id).ok_or_else(|| StorageError::FileNotFound(file_id.to_string()))?;
        file.pages.clear();
        debug!(%file_id, "file truncated");
        Ok(())
    }
}

impl WriteCache for MemoryPageCache {
    fn filled_up_to(&self, file_id: FileId) -> StorageResult<PageIndex> {
        let namespace = self.namespace.read();
        let file = namespace.files.get(&file_id).ok_or_else(|| StorageError::FileNotFound(file_id.to_string()))?;
        Ok(file.pages.len() as PageIndex)
    }

    fn book_file_id(&self, file_name: &str) -> StorageResult<FileId> {
        let mut namespace = self.namespace.write();
        if namespace.ids_by_name.contains_key(file_name) {
            return Err(StorageError::IllegalFileState(format!("File with name {} already exists", file_name)));
        }
        if let Some(file_id) = namespace.booked.get(file_name) {
            return Ok(*file_id);
        }

        let local_id = namespace.next_local_id;
        namespace.next_local_id = local_id.checked_add(1).ok_or_else(|| StorageError::InvalidOperation("file ids are exhausted".to_string()))?;
        let file_id = FileId::compose(local_id, self.storage_id.unwrap_or(0));
        namespace.booked.insert(file_name.to_string(), file_id);
        Ok(file_id)
    }

    fn load_file(&self, file_name: &str) -> StorageResult<FileId> {
        self.file_id_by_name(file_name).ok_or_else(|| StorageError::FileNotFound(file_name.to_string()))
    }

    fn file_id_by_name(&self, file_name: &str) -> Option<FileId> {
        self.namespace.read().ids_by_name.get(file_name).copied()
    }

    fn file_name_by_id(&self, file_id: FileId) -> Option<String> {
        self.namespace.read().files.get(&file_id).map(|file| file.name.clone())
    }

    fn native_file_name_by_id(&self, file_id: FileId) -> Option<String> {
        self.namespace.read().files.get(&file_id).map(|file| format!("{}.{}", file.name, file_id.local_id()))
    }

    fn exists(&self, file_name: &str) -> bool {
        self.namespace.read().ids_by_name.contains_key(file_name)
    }

    fn exists_id(&self, file_id: FileId) -> bool {
        self.namespace.read().files.contains_key(&file_id)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn storage_id(&self) -> Option<StorageId> {
        self.storage_id
    }

    fn verify_checksums(&self) -> bool {
        self.verify_checksums
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_file(name: &str) -> (MemoryPageCache, FileId) {
        let cache = MemoryPageCache::new(64, None);
        let file_id = cache.book_file_id(name).unwrap();
        cache.add_file(name, file_id).unwrap();
        (cache, file_id)
    }

    #[test]
    fn test_booking_returns_same_id_until_added() {
        let cache = MemoryPageCache::new(64, Some(3));
        let first = cache.book_file_id("a").unwrap();
        let again = cache.book_file_id("a").unwrap();
        let other = cache.book_file_id("b").unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(first.storage_id(), 3);

        cache.add_file("a", first).unwrap();
        assert!(cache.exists("a"));
        assert!(matches!(cache.book_file_id("a"), Err(StorageError::IllegalFileState(_))));
    }

    #[test]
    fn test_allocate_and_load() {
        let (cache, file_id) = cache_with_file("data");
        assert_eq!(cache.filled_up_to(file_id).unwrap(), 0);

        {
            let mut page = cache.allocate_new_page(file_id, LogSequenceNumber::new(0, 8)).unwrap();
            assert_eq!(page.page_index(), 0);
            page.data[0..4].copy_from_slice(b"abcd");
            assert_eq!(cache.stats().pinned_pages(), 1);
        }
        assert_eq!(cache.stats().pinned_pages(), 0);
        assert_eq!(cache.filled_up_to(file_id).unwrap(), 1);

        let page = cache.load_for_read(file_id, 0, true).unwrap().unwrap();
        assert_eq!(&page.data[0..4], b"abcd");
        assert_eq!(page.rec_lsn(), Some(LogSequenceNumber::new(0, 8)));
        assert!(cache.load_for_read(file_id, 1, true).unwrap().is_none());
    }

    #[test]
    fn test_checksum_verified_on_load() {
        let (cache, file_id) = cache_with_file("data");
        drop(cache.allocate_new_page(file_id, LogSequenceNumber::default()).unwrap());

        let latch = cache.latch(file_id, 0).unwrap().unwrap();
        latch.write().data[0] = 0xFF;

        assert!(matches!(cache.load_for_read(file_id, 0, true), Err(StorageError::Corruption(_))));
        assert!(cache.load_for_read(file_id, 0, false).unwrap().is_some());
        assert_eq!(cache.stats().pinned_pages(), 0);
    }

    #[test]
    fn test_readers_share_latch() {
        let (cache, file_id) = cache_with_file("data");
        drop(cache.allocate_new_page(file_id, LogSequenceNumber::default()).unwrap());

        let first = cache.load_for_read(file_id, 0, true).unwrap().unwrap();
        let second = cache.load_for_read(file_id, 0, true).unwrap().unwrap();
        assert_eq!(cache.stats().pinned_pages(), 2);
        drop(first);
        drop(second);
        assert_eq!(cache.stats().pinned_pages(), 0);
    }

    #[test]
    fn test_delete_and_truncate() {
        let (cache, file_id) = cache_with_file("data");
        drop(cache.allocate_new_page(file_id, LogSequenceNumber::default()).unwrap());
        drop(cache.allocate_new_page(file_id, LogSequenceNumber::default()).unwrap());

        cache.truncate_file(file_id).unwrap();
        assert_eq!(cache.filled_up_to(file_id).unwrap(), 0);

        assert_eq!(cache.file_name_by_id(file_id).as_deref(), Some("data"));
        assert_eq!(cache.native_file_name_by_id(file_id), Some(format!("data.{}", file_id.local_id())));
        cache.delete_file(file_id).unwrap();
        assert!(!cache.exists("data"));
        assert!(!cache.exists_id(file_id));
        assert!(matches!(cache.load_for_read(file_id, 0, true), Err(StorageError::FileNotFound(_))));
        assert!(matches!(cache.load_file("data"), Err(StorageError::FileNotFound(_))));
    }
}
