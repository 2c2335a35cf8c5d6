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


// Common types and utilities for the storage engine

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_common::{FileId, PageIndex, StorageId};

use crate::storage_engine::wal::LogSequenceNumber;

/// Default size of a page in bytes
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Configuration of the write-ahead log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory holding the WAL segments
    pub directory: PathBuf,
    /// Maximum size of one segment in bytes
    pub max_segment_size: u64,
    /// Fsync the log when an atomic unit end record is appended
    pub sync_on_unit_end: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./wal"),
            max_segment_size: 64 * 1024 * 1024, // 64 MB
            sync_on_unit_end: true,
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Size of each page in bytes
    pub page_size: usize,
    /// Id of this storage when several storages share one page cache
    pub storage_id: Option<StorageId>,
    /// Whether pages read by atomic operations verify their checksum
    pub verify_checksums: bool,
    /// Write-ahead log settings
    pub wal: WalConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            storage_id: None,
            verify_checksums: true,
            wal: WalConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> StorageResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| StorageError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.page_size == 0 {
            return Err(StorageError::InvalidOperation("page size must be positive".to_string()));
        }
        if self.wal.max_segment_size == 0 {
            return Err(StorageError::InvalidOperation("WAL segment size must be positive".to_string()));
        }
        Ok(())
    }
}

/// Error types specific to the storage engine
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A file is used in a way its state inside the atomic operation forbids
    #[error("Illegal file state: {0}")]
    IllegalFileState(String),

    #[error("Page {page_index} is not found in file {file_id}")]
    PageNotFound { file_id: FileId, page_index: PageIndex },

    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Corrupted storage: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Changes were durably logged up to `end_lsn` but could not be applied to
    /// the page cache. The process must restart and restore from the log.
    #[error("Failed to apply atomic operation logged at {end_lsn}: {source}")]
    ApplyFailed {
        end_lsn: LogSequenceNumber,
        #[source]
        source: Box<StorageError>,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Build the storage-state error raised for a file deleted inside the current operation
pub fn file_deleted_error(file_id: FileId) -> StorageError {
    StorageError::IllegalFileState(format!("File with id {} is deleted", file_id))
}

/// Calculate CRC32 checksum for data integrity
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.storage_id, None);
        assert!(config.wal.sync_on_unit_end);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = StorageConfig::from_json(r#"{ "page_size": 4096, "storage_id": 5, "wal": { "max_segment_size": 1024 } }"#).unwrap();
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.storage_id, Some(5));
        assert_eq!(config.wal.max_segment_size, 1024);
        assert_eq!(config.wal.directory, PathBuf::from("./wal"));
    }

    #[test]
    fn test_config_rejects_zero_page_size() {
        let err = StorageConfig::from_json(r#"{ "page_size": 0 }"#).unwrap_err();
        assert!(matches!(err, StorageError::InvalidOperation(_)));
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::PageNotFound { file_id: FileId::compose(2, 1), page_index: 4 };
        assert_eq!(err.to_string(), "Page 4 is not found in file 1:2");
        assert!(file_deleted_error(FileId(9)).to_string().contains("deleted"));
    }
}
