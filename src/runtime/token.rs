//! Operation token tracking for io_uring completion correlation.
//!
//! Every submitted request owns one [`Record`] in a slab. The slab key is the
//! token handed to the kernel as user data, so a completion is correlated
//! back to its record by index, never by address, and growing the slab
//! cannot invalidate anything the kernel holds.

use super::op::{Record, Request};
use slab::Slab;

/// Arena of in-flight operation records.
pub(crate) struct TokenTable {
    records: Slab<Record>,
    cancels: usize,
}

impl TokenTable {
    /// Create a new table with specified initial capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Slab::with_capacity(capacity),
            cancels: 0,
        }
    }

    /// Store a record and return its token together with the stored record,
    /// so the caller can build the submission from memory the table owns.
    pub fn alloc(&mut self, record: Record) -> (u64, &mut Record) {
        if matches!(record.request, Request::Cancel { .. }) {
            self.cancels += 1;
        }
        let entry = self.records.vacant_entry();
        let token = entry.key() as u64;
        (token, entry.insert(record))
    }

    /// Get the record for a token.
    ///
    /// Returns None if the token is invalid or already freed.
    pub fn get_mut(&mut self, token: u64) -> Option<&mut Record> {
        self.records.get_mut(token as usize)
    }

    /// Free a token, making it available for reuse.
    ///
    /// Returns the record that was associated with the token.
    pub fn free(&mut self, token: u64) -> Option<Record> {
        let idx = token as usize;
        if !self.records.contains(idx) {
            return None;
        }
        let record = self.records.remove(idx);
        if matches!(record.request, Request::Cancel { .. }) {
            self.cancels -= 1;
        }
        Some(record)
    }

    /// Number of cancellation records currently in flight.
    pub fn cancels(&self) -> usize {
        self.cancels
    }

    /// Number of currently allocated tokens.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if there are no allocated tokens.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
