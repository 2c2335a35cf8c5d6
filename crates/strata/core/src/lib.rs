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


//! Atomic operation engine of a paginated storage.
//!
//! An [`AtomicOperation`](atomic_operations::AtomicOperation) stages page and
//! file changes privately. Committing it writes the staged changes to a
//! [`DurableLog`](storage_engine::DurableLog) and only then applies them to the
//! shared page cache, so other operations never observe a partial unit and a
//! crash can be repaired with [`WalRestorer`](recovery::WalRestorer).

pub mod atomic_operations;
pub mod recovery;
pub mod storage_engine;

pub use atomic_operations::{AtomicOperation, AtomicOperationsManager, PageHandle, UnitOutcome};
pub use recovery::{RestoreSummary, WalRestorer};
pub use storage_engine::{DurableLog, LogSequenceNumber, MemoryPageCache, MemoryWal, StorageConfig, StorageError, StorageResult, WalRecord, WriteAheadLog};
pub use strata_common::{FileId, PageIndex, StorageId};
