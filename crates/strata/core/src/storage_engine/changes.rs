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


// Page diff log
// Records the byte ranges an atomic operation wrote to a page. The same log is
// overlaid on the original page for reads inside the operation, shipped in the
// page update WAL record and finally patched into the cached page on commit.

use std::cmp::{max, min};
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage_engine::lib::{StorageError, StorageResult};

/// Byte-range changes of one page.
///
/// Portions never overlap and never touch: a write adjacent to or overlapping
/// existing portions is merged with them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageChanges {
    portions: BTreeMap<usize, Vec<u8>>,
}

impl PageChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_changes(&self) -> bool {
        !self.portions.is_empty()
    }

    /// Number of changed bytes
    pub fn changed_bytes(&self) -> usize {
        self.portions.values().map(Vec::len).sum()
    }

    /// Iterate over `(offset, bytes)` portions in offset order
    pub fn portions(&self) -> impl Iterator<Item = (usize, &[u8])> {
        self.portions.iter().map(|(offset, data)| (*offset, data.as_slice()))
    }

    /// Record `bytes` written at `offset`
    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let end = offset + bytes.len();

        let touching: Vec<usize> = self
            .portions
            .range(..=end)
            .filter(|(start, data)| **start + data.len() >= offset)
            .map(|(start, _)| *start)
            .collect();

        let mut merged_start = offset;
        let mut merged_end = end;
        for start in &touching {
            if let Some(data) = self.portions.get(start) {
                merged_start = min(merged_start, *start);
                merged_end = max(merged_end, *start + data.len());
            }
        }

        let mut merged = vec![0; merged_end - merged_start];
        for start in touching {
            if let Some(data) = self.portions.remove(&start) {
                let at = start - merged_start;
                merged[at..at + data.len()].copy_from_slice(&data);
            }
        }
        merged[offset - merged_start..end - merged_start].copy_from_slice(bytes);
        self.portions.insert(merged_start, merged);
    }

    /// Fill `out` with the page content at `offset` as seen through the changes.
    ///
    /// `base` is the original page; `None` stands for a page that does not exist
    /// yet and reads as zeros.
    pub fn read_into(&self, base: Option<&[u8]>, offset: usize, out: &mut [u8]) {
        match base {
            Some(base) => out.copy_from_slice(&base[offset..offset + out.len()]),
            None => out.fill(0),
        }

        let end = offset + out.len();
        for (start, data) in self.portions.range(..end) {
            let portion_end = start + data.len();
            if portion_end <= offset {
                continue;
            }
            let from = max(*start, offset);
            let to = min(portion_end, end);
            out[from - offset..to - offset].copy_from_slice(&data[from - start..to - start]);
        }
    }

    /// Patch every recorded portion into `page`. Changes that do not fit the
    /// page leave it untouched.
    pub fn apply_to(&self, page: &mut [u8]) -> StorageResult<()> {
        if let Some((offset, data)) = self.portions.iter().next_back() {
            if offset + data.len() > page.len() {
                return Err(StorageError::Corruption(format!("page change at offset {} of {} bytes does not fit a page of {} bytes", offset, data.len(), page.len())));
            }
        }
        for (offset, data) in &self.portions {
            page[*offset..*offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_changes() {
        let changes = PageChanges::new();
        assert!(!changes.has_changes());

        let mut out = [7u8; 4];
        changes.read_into(None, 0, &mut out);
        assert_eq!(out, [0, 0, 0, 0]);
    }

    #[test]
    fn test_adjacent_writes_are_merged() {
        let mut changes = PageChanges::new();
        changes.set_bytes(4, &[1, 2]);
        changes.set_bytes(6, &[3]);
        changes.set_bytes(0, &[9, 9, 9, 9]);

        let portions: Vec<_> = changes.portions().collect();
        assert_eq!(portions, vec![(0, &[9, 9, 9, 9, 1, 2, 3][..])]);
        assert_eq!(changes.changed_bytes(), 7);
    }

    #[test]
    fn test_overlapping_write_wins() {
        let mut changes = PageChanges::new();
        changes.set_bytes(2, &[1, 1, 1, 1]);
        changes.set_bytes(10, &[5]);
        changes.set_bytes(4, &[2, 2, 2, 2, 2, 2]);

        let portions: Vec<_> = changes.portions().collect();
        assert_eq!(portions, vec![(2, &[1, 1, 2, 2, 2, 2, 2, 2, 5][..])]);
    }

    #[test]
    fn test_overlay_on_base() {
        let base = [1u8; 8];
        let mut changes = PageChanges::new();
        changes.set_bytes(3, &[5, 6]);

        let mut out = [0u8; 4];
        changes.read_into(Some(&base), 2, &mut out);
        assert_eq!(out, [1, 5, 6, 1]);

        let mut page = base;
        changes.apply_to(&mut page).unwrap();
        assert_eq!(page, [1, 1, 1, 5, 6, 1, 1, 1]);
    }

    #[test]
    fn test_changes_beyond_page_are_rejected() {
        let mut changes = PageChanges::new();
        changes.set_bytes(0, &[1]);
        changes.set_bytes(100, &[2, 2]);

        let mut page = [0u8; 64];
        assert!(matches!(changes.apply_to(&mut page), Err(StorageError::Corruption(_))));
        assert_eq!(page, [0u8; 64]);

        let mut page = [0u8; 102];
        changes.apply_to(&mut page).unwrap();
        assert_eq!(&page[100..], &[2, 2]);
    }

    const PAGE: usize = 64;

    fn writes() -> impl Strategy<Value = Vec<(usize, Vec<u8>)>> {
        prop::collection::vec((0..PAGE).prop_flat_map(|offset| (Just(offset), prop::collection::vec(any::<u8>(), 0..=PAGE - offset))), 0..24)
    }

    proptest! {
        #[test]
        fn prop_reads_match_plain_buffer(base in prop::collection::vec(any::<u8>(), PAGE), writes in writes()) {
            let mut expected = base.clone();
            let mut changes = PageChanges::new();
            for (offset, bytes) in &writes {
                expected[*offset..*offset + bytes.len()].copy_from_slice(bytes);
                changes.set_bytes(*offset, bytes);
            }

            let mut seen = vec![0u8; PAGE];
            changes.read_into(Some(&base), 0, &mut seen);
            prop_assert_eq!(&seen, &expected);

            let mut patched = base.clone();
            changes.apply_to(&mut patched).unwrap();
            prop_assert_eq!(&patched, &expected);

            // Portions stay disjoint and separated
            let portions: Vec<_> = changes.portions().collect();
            for pair in portions.windows(2) {
                prop_assert!(pair[0].0 + pair[0].1.len() < pair[1].0);
            }
        }
    }
}
