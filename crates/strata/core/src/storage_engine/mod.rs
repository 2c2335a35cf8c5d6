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


// Storage Engine Module
// Collaborators of the atomic operation engine: durable log, page cache and page diffs

pub mod buffer_manager;
pub mod changes;
pub mod lib;
pub mod page;
pub mod wal;

// Public exports
pub use buffer_manager::{CacheStats, MemoryPageCache, PageReadGuard, PageWriteGuard, ReadCache, WriteCache};
pub use changes::PageChanges;
pub use lib::{DEFAULT_PAGE_SIZE, StorageConfig, StorageError, StorageResult, WalConfig, calculate_checksum};
pub use page::{PageFrame, PageHeader};
pub use wal::{DurableLog, LogSequenceNumber, MemoryWal, WalRecord, WalVerifyReport, WriteAheadLog};
