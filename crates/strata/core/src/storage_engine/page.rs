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


// Page frame module
// Pages are opaque byte buffers. The LSN of the last change applied to a page and
// the checksum of its content live in a header kept next to the bytes, so callers
// own the whole buffer.

use crate::storage_engine::wal::LogSequenceNumber;

/// Header of a cached page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageHeader {
    /// LSN of the last WAL record applied to the page
    pub lsn: LogSequenceNumber,
    /// CRC32 of the LSN and the page data
    pub checksum: u32,
}

/// A page held by the page cache
#[derive(Debug, Clone)]
pub struct PageFrame {
    pub header: PageHeader,
    pub data: Vec<u8>,
    /// LSN of the atomic unit end record that last changed the page. The page
    /// must not be written back before the log is durable up to this point.
    end_lsn: Option<LogSequenceNumber>,
    /// Log position from which the page has been dirty
    rec_lsn: Option<LogSequenceNumber>,
}

impl PageFrame {
    /// Create a zero-filled page with a valid checksum
    pub fn new(page_size: usize) -> Self {
        let mut frame = Self {
            header: PageHeader::default(),
            data: vec![0; page_size],
            end_lsn: None,
            rec_lsn: None,
        };
        frame.update_checksum();
        frame
    }

    pub fn lsn(&self) -> LogSequenceNumber {
        self.header.lsn
    }

    pub fn set_lsn(&mut self, lsn: LogSequenceNumber) {
        self.header.lsn = lsn;
    }

    pub fn end_lsn(&self) -> Option<LogSequenceNumber> {
        self.end_lsn
    }

    pub fn set_end_lsn(&mut self, lsn: LogSequenceNumber) {
        self.end_lsn = Some(lsn);
    }

    pub fn rec_lsn(&self) -> Option<LogSequenceNumber> {
        self.rec_lsn
    }

    /// Remember where the page became dirty, keeping the earliest position
    pub fn mark_dirty_from(&mut self, lsn: LogSequenceNumber) {
        if self.rec_lsn.is_none() {
            self.rec_lsn = Some(lsn);
        }
    }

    /// Calculate the checksum of the page (LSN + data)
    pub fn calculate_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.header.lsn.segment.to_le_bytes());
        hasher.update(&self.header.lsn.position.to_le_bytes());
        hasher.update(&self.data);
        hasher.finalize()
    }

    pub fn update_checksum(&mut self) {
        self.header.checksum = self.calculate_checksum();
    }

    pub fn verify_checksum(&self) -> bool {
        self.header.checksum == self.calculate_checksum()
    }
}
