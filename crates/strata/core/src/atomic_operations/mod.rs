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


// Atomic Operations Module
// All-or-nothing, crash-durable changes of many pages across many files

pub mod file_changes;
pub mod manager;
pub mod metadata;
pub mod operation;

// Public exports
pub use file_changes::{CacheEntryChanges, FileChanges, FileLifecycle, PageExtent, PageHandle};
pub use manager::AtomicOperationsManager;
pub use metadata::{BonsaiBucketPointer, DeletedRecordPositions, OperationMetadata};
pub use operation::{AtomicOperation, UnitOutcome};
