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


//! Identifiers shared by the Strata crates.
//!
//! A file id is 64 bits wide: the high half names the storage instance that owns
//! the file and the low half is the file's id local to that storage. Several
//! storages can therefore share one page cache namespace without collisions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Index of a page inside a file
pub type PageIndex = u64;

/// Identifier of a storage instance sharing a page cache
pub type StorageId = u32;

/// Errors produced while parsing identifiers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("invalid file id: {0}")]
    InvalidFileId(String),
}

/// Composite file identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl FileId {
    /// Build a file id from a local id and the owning storage id
    pub const fn compose(local_id: u32, storage_id: StorageId) -> Self {
        Self(((storage_id as u64) << 32) | local_id as u64)
    }

    /// Storage part of the id, 0 for a legacy raw local id
    pub const fn storage_id(self) -> StorageId {
        (self.0 >> 32) as StorageId
    }

    pub const fn local_id(self) -> u32 {
        self.0 as u32
    }

    /// Promote a raw local id to the composite form of `storage_id`.
    ///
    /// Ids that already carry a storage part, and every id when no storage id
    /// is configured, are returned unchanged.
    pub const fn with_storage(self, storage_id: Option<StorageId>) -> Self {
        match storage_id {
            Some(storage_id) if self.storage_id() == 0 => Self::compose(self.local_id(), storage_id),
            _ => self,
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.storage_id(), self.local_id())
    }
}

impl FromStr for FileId {
    type Err = IdError;

    /// Accepts either `storage:local` or a plain 64-bit number
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdError::InvalidFileId(s.to_string());
        match s.split_once(':') {
            Some((storage, local)) => {
                let storage = storage.trim().parse::<u32>().map_err(|_| invalid())?;
                let local = local.trim().parse::<u32>().map_err(|_| invalid())?;
                Ok(Self::compose(local, storage))
            }
            None => s.trim().parse::<u64>().map(FileId).map_err(|_| invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_and_split() {
        let id = FileId::compose(7, 3);
        assert_eq!(id.storage_id(), 3);
        assert_eq!(id.local_id(), 7);
        assert_eq!(id.0, (3u64 << 32) | 7);
    }

    #[test]
    fn test_legacy_id_promotion() {
        let raw = FileId(7);
        assert_eq!(raw.with_storage(Some(3)), FileId::compose(7, 3));
        assert_eq!(raw.with_storage(None), raw);

        // Already composite ids keep their storage part
        let foreign = FileId::compose(7, 9);
        assert_eq!(foreign.with_storage(Some(3)), foreign);
    }

    #[test]
    fn test_parse() {
        assert_eq!("3:7".parse::<FileId>().unwrap(), FileId::compose(7, 3));
        assert_eq!("42".parse::<FileId>().unwrap(), FileId(42));
        assert!("x:1".parse::<FileId>().is_err());
        assert_eq!(FileId::compose(7, 3).to_string(), "3:7");
    }
}
