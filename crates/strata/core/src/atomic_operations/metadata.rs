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


// Side data of an atomic operation: the metadata map written into the atomic
// unit end record and the slots freed by the operation.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Insertion-ordered key/value metadata of an atomic operation.
///
/// Adding a key that is already present replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetadata {
    entries: Vec<(String, Vec<u8>)>,
}

impl OperationMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Vec<u8>) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Pointer to the root bucket of a bonsai tree (a tree-structured collection
/// stored inside a shared file)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BonsaiBucketPointer {
    pub page_index: u64,
    pub page_offset: u32,
}

impl BonsaiBucketPointer {
    pub const fn new(page_index: u64, page_offset: u32) -> Self {
        Self { page_index, page_offset }
    }
}

/// Record slots freed inside one operation, keyed by (cluster id, page index)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletedRecordPositions {
    positions: HashMap<(u32, u64), HashSet<u32>>,
}

impl DeletedRecordPositions {
    pub fn add(&mut self, cluster_id: u32, page_index: u64, record_position: u32) {
        self.positions.entry((cluster_id, page_index)).or_default().insert(record_position);
    }

    pub fn get(&self, cluster_id: u32, page_index: u64) -> Option<&HashSet<u32>> {
        self.positions.get(&(cluster_id, page_index))
    }

    pub fn into_entries(self) -> impl Iterator<Item = ((u32, u64), HashSet<u32>)> {
        self.positions.into_iter()
    }
}
