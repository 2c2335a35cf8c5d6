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


// Change buffer of an atomic operation
// Per-file and per-page staging records. A page record overlays its diff log on
// the pinned cache page it was loaded from, so reads inside the operation see
// the operation's own writes while the shared page stays untouched.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use strata_common::{FileId, PageIndex};

use crate::storage_engine::buffer_manager::PageReadGuard;
use crate::storage_engine::changes::PageChanges;
use crate::storage_engine::lib::{StorageError, StorageResult};
use crate::storage_engine::wal::LogSequenceNumber;

/// Lifecycle of a file inside one atomic operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLifecycle {
    /// The file existed before the operation
    Existing,
    /// The file is created by the operation
    Created { name: String },
    /// An existing file deleted and added again under the same name
    Recreated { name: String },
    /// An existing file truncated by the operation
    Truncated,
}

impl FileLifecycle {
    pub fn name(&self) -> Option<&str> {
        match self {
            FileLifecycle::Created { name } | FileLifecycle::Recreated { name } => Some(name),
            FileLifecycle::Existing | FileLifecycle::Truncated => None,
        }
    }
}

/// Which side knows the number of pages of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageExtent {
    /// The page cache
    Shared,
    /// The operation. Holds the highest page index, `None` for an empty file.
    Local(Option<PageIndex>),
}

impl PageExtent {
    /// Whether `page_index` is below the end of a local extent. A shared extent
    /// lets the cache decide.
    pub fn covers(&self, page_index: PageIndex) -> bool {
        match self {
            PageExtent::Shared => true,
            PageExtent::Local(None) => false,
            PageExtent::Local(Some(max)) => page_index <= *max,
        }
    }

    /// Local page count, `None` for a shared extent
    pub fn local_len(&self) -> Option<PageIndex> {
        match self {
            PageExtent::Shared => None,
            PageExtent::Local(None) => Some(0),
            PageExtent::Local(Some(max)) => Some(max + 1),
        }
    }
}

/// Position of a page touched by an atomic operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle {
    pub file_id: FileId,
    pub page_index: PageIndex,
}

/// Staged changes of one page
pub struct CacheEntryChanges {
    file_id: FileId,
    page_index: PageIndex,
    page_size: usize,
    pub(crate) delegate: Option<PageReadGuard>,
    pub(crate) changes: PageChanges,
    is_new: bool,
    pub(crate) verify_checksum: bool,
    initial_lsn: LogSequenceNumber,
    pub(crate) change_lsn: Option<LogSequenceNumber>,
}

impl CacheEntryChanges {
    /// Record over a page pinned from the cache
    pub(crate) fn loaded(delegate: PageReadGuard, page_size: usize, verify_checksum: bool) -> Self {
        Self {
            file_id: delegate.file_id(),
            page_index: delegate.page_index(),
            page_size,
            initial_lsn: delegate.lsn(),
            delegate: Some(delegate),
            changes: PageChanges::new(),
            is_new: false,
            verify_checksum,
            change_lsn: None,
        }
    }

    /// Record of a page appended by the operation; it has no backing storage yet
    pub(crate) fn new_page(file_id: FileId, page_index: PageIndex, page_size: usize) -> Self {
        Self {
            file_id,
            page_index,
            page_size,
            delegate: None,
            changes: PageChanges::new(),
            is_new: true,
            verify_checksum: false,
            initial_lsn: LogSequenceNumber::default(),
            change_lsn: None,
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn page_index(&self) -> PageIndex {
        self.page_index
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn has_changes(&self) -> bool {
        self.changes.has_changes()
    }

    pub fn changes(&self) -> &PageChanges {
        &self.changes
    }

    /// LSN the page carried when the operation first loaded it
    pub fn initial_lsn(&self) -> LogSequenceNumber {
        self.initial_lsn
    }

    /// LSN of the page update record, known once the operation is logged
    pub fn change_lsn(&self) -> Option<LogSequenceNumber> {
        self.change_lsn
    }

    fn check_range(&self, offset: usize, len: usize) -> StorageResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.page_size => Ok(()),
            _ => Err(StorageError::InvalidOperation(format!(
                "range {}..{} is outside of page {} of file {} ({} bytes)",
                offset,
                offset.saturating_add(len),
                self.page_index,
                self.file_id,
                self.page_size
            ))),
        }
    }

    fn check_pinned(&self) -> StorageResult<()> {
        if self.is_new || self.delegate.is_some() {
            Ok(())
        } else {
            Err(StorageError::InvalidOperation(format!("page {} of file {} is released", self.page_index, self.file_id)))
        }
    }

    /// Copy page content at `offset` into `out`
    pub fn read_into(&self, offset: usize, out: &mut [u8]) -> StorageResult<()> {
        self.check_range(offset, out.len())?;
        self.check_pinned()?;
        let base = self.delegate.as_ref().map(|page| page.data.as_slice());
        self.changes.read_into(base, offset, out);
        Ok(())
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> StorageResult<Vec<u8>> {
        let mut out = vec![0; len];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    /// Stage a write of `bytes` at `offset`
    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) -> StorageResult<()> {
        self.check_range(offset, bytes.len())?;
        self.check_pinned()?;
        self.changes.set_bytes(offset, bytes);
        Ok(())
    }

    pub fn get_u8(&self, offset: usize) -> StorageResult<u8> {
        let mut buf = [0u8; 1];
        self.read_into(offset, &mut buf)?;
        Ok(buf[0])
    }

    pub fn set_u8(&mut self, offset: usize, value: u8) -> StorageResult<()> {
        self.set_bytes(offset, &[value])
    }

    pub fn get_u16(&self, offset: usize) -> StorageResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(offset, &mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    pub fn set_u16(&mut self, offset: usize, value: u16) -> StorageResult<()> {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.set_bytes(offset, &buf)
    }

    pub fn get_u32(&self, offset: usize) -> StorageResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(offset, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) -> StorageResult<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.set_bytes(offset, &buf)
    }

    pub fn get_i32(&self, offset: usize) -> StorageResult<i32> {
        let mut buf = [0u8; 4];
        self.read_into(offset, &mut buf)?;
        Ok(LittleEndian::read_i32(&buf))
    }

    pub fn set_i32(&mut self, offset: usize, value: i32) -> StorageResult<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, value);
        self.set_bytes(offset, &buf)
    }

    pub fn get_u64(&self, offset: usize) -> StorageResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    pub fn set_u64(&mut self, offset: usize, value: u64) -> StorageResult<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.set_bytes(offset, &buf)
    }

    pub fn get_i64(&self, offset: usize) -> StorageResult<i64> {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf)?;
        Ok(LittleEndian::read_i64(&buf))
    }

    pub fn set_i64(&mut self, offset: usize, value: i64) -> StorageResult<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_i64(&mut buf, value);
        self.set_bytes(offset, &buf)
    }
}

impl std::fmt::Debug for CacheEntryChanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntryChanges")
            .field("file_id", &self.file_id)
            .field("page_index", &self.page_index)
            .field("is_new", &self.is_new)
            .field("pinned", &self.delegate.is_some())
            .field("changed_bytes", &self.changes.changed_bytes())
            .field("initial_lsn", &self.initial_lsn)
            .field("change_lsn", &self.change_lsn)
            .finish()
    }
}

/// Staged changes of one file
#[derive(Debug)]
pub struct FileChanges {
    pub(crate) lifecycle: FileLifecycle,
    pub(crate) extent: PageExtent,
    pub(crate) pages: BTreeMap<PageIndex, CacheEntryChanges>,
}

impl FileChanges {
    /// Record of a file that exists in the cache
    pub fn existing() -> Self {
        Self { lifecycle: FileLifecycle::Existing, extent: PageExtent::Shared, pages: BTreeMap::new() }
    }

    pub fn created(name: String) -> Self {
        Self { lifecycle: FileLifecycle::Created { name }, extent: PageExtent::Local(None), pages: BTreeMap::new() }
    }

    pub fn recreated(name: String) -> Self {
        Self { lifecycle: FileLifecycle::Recreated { name }, extent: PageExtent::Local(None), pages: BTreeMap::new() }
    }

    pub fn lifecycle(&self) -> &FileLifecycle {
        &self.lifecycle
    }

    pub fn extent(&self) -> PageExtent {
        self.extent
    }

    pub fn name(&self) -> Option<&str> {
        self.lifecycle.name()
    }

    /// Whether the file only exists inside the operation
    pub fn is_created(&self) -> bool {
        matches!(self.lifecycle, FileLifecycle::Created { .. })
    }

    /// Whether every page of the file lives in the operation
    pub fn is_new_file(&self) -> bool {
        matches!(self.lifecycle, FileLifecycle::Created { .. } | FileLifecycle::Recreated { .. })
    }

    pub fn page(&self, page_index: PageIndex) -> Option<&CacheEntryChanges> {
        self.pages.get(&page_index)
    }

    /// Drop buffered pages and empty the local extent. Only a file that existed
    /// before the operation is flagged for truncation in the cache.
    pub(crate) fn truncate(&mut self) {
        self.pages.clear();
        self.extent = PageExtent::Local(None);
        if matches!(self.lifecycle, FileLifecycle::Existing) {
            self.lifecycle = FileLifecycle::Truncated;
        }
    }

    /// Release every pinned cache page
    pub(crate) fn unpin_all(&mut self) {
        for page in self.pages.values_mut() {
            page.delegate = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 32;

    fn new_page() -> CacheEntryChanges {
        CacheEntryChanges::new_page(FileId::compose(1, 0), 0, PAGE_SIZE)
    }

    #[test]
    fn test_new_page_reads_zeroes_and_own_writes() {
        let mut page = new_page();
        assert!(page.is_new());
        assert!(!page.has_changes());
        assert_eq!(page.get_bytes(0, 4).unwrap(), vec![0; 4]);

        page.set_u32(4, 0xDEADBEEF).unwrap();
        page.set_i64(8, -42).unwrap();
        page.set_u8(31, 7).unwrap();
        assert_eq!(page.get_u32(4).unwrap(), 0xDEADBEEF);
        assert_eq!(page.get_i64(8).unwrap(), -42);
        assert_eq!(page.get_u8(31).unwrap(), 7);
        assert_eq!(page.get_u16(0).unwrap(), 0);
        page.set_u16(16, 0xBEEF).unwrap();
        page.set_i32(20, -7).unwrap();
        assert_eq!(page.get_u16(16).unwrap(), 0xBEEF);
        assert_eq!(page.get_i32(20).unwrap(), -7);
        assert!(page.has_changes());
        assert_eq!(page.initial_lsn(), LogSequenceNumber::default());
    }

    #[test]
    fn test_out_of_page_access_is_rejected() {
        let mut page = new_page();
        assert!(matches!(page.set_bytes(30, &[1, 2, 3]), Err(StorageError::InvalidOperation(_))));
        assert!(matches!(page.get_u64(28), Err(StorageError::InvalidOperation(_))));
        assert!(matches!(page.get_bytes(usize::MAX, 2), Err(StorageError::InvalidOperation(_))));
        assert!(!page.has_changes());
    }

    #[test]
    fn test_extent() {
        assert!(PageExtent::Shared.covers(100));
        assert!(!PageExtent::Local(None).covers(0));
        assert!(PageExtent::Local(Some(2)).covers(2));
        assert!(!PageExtent::Local(Some(2)).covers(3));
        assert_eq!(PageExtent::Local(Some(2)).local_len(), Some(3));
        assert_eq!(PageExtent::Local(None).local_len(), Some(0));
        assert_eq!(PageExtent::Shared.local_len(), None);
    }

    #[test]
    fn test_truncate() {
        let mut existing = FileChanges::existing();
        existing.pages.insert(0, new_page());
        existing.truncate();
        assert_eq!(existing.lifecycle(), &FileLifecycle::Truncated);
        assert_eq!(existing.extent(), PageExtent::Local(None));
        assert!(existing.page(0).is_none());

        let mut created = FileChanges::created("t".to_string());
        created.truncate();
        assert!(created.is_created());
        assert_eq!(created.name(), Some("t"));
    }
}
