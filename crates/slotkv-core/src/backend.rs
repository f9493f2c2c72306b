//! Contract between the cache and the durable key-value table beneath it.
//!
//! The cache only ever needs point operations keyed by raw bytes. Writers are
//! serialized by the storage's exclusive lock; readers may call in
//! concurrently, so implementations must be internally synchronized.

use std::path::Path;

use crate::error::StoreResult;

/// Outcome of rewriting a table without its dead records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Live records carried over
    pub live_records: u64,
    /// File size before compaction
    pub bytes_before: u64,
    /// File size after compaction
    pub bytes_after: u64,
}

impl CompactionReport {
    /// Space reclaimed in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Persistent store consumed by [`Storage`](crate::Storage).
pub trait Backend: Send + Sync {
    /// Full value stored under `key`.
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Copy at most `buf.len()` leading bytes of the value into `buf`.
    ///
    /// Returns the number of bytes copied; a result equal to `buf.len()` means
    /// the value may be longer than the buffer.
    fn get_into(&self, key: &[u8], buf: &mut [u8]) -> StoreResult<Option<usize>>;

    /// Insert or replace `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Remove `key`; `false` when it was absent.
    fn delete(&self, key: &[u8]) -> StoreResult<bool>;

    /// Length of the value stored under `key`.
    fn value_size(&self, key: &[u8]) -> StoreResult<Option<usize>>;

    /// Make every completed write durable.
    fn sync(&self) -> StoreResult<()>;

    /// Write a consistent copy of the table to `dest`.
    fn copy_to(&self, dest: &Path) -> StoreResult<()>;

    /// Number of live records.
    fn record_count(&self) -> u64;

    /// Message of the most recent failed operation.
    fn last_error(&self) -> Option<String>;

    /// Snapshot of every live key, in no particular order.
    fn keys(&self) -> StoreResult<Vec<Vec<u8>>>;

    /// Fraction of the table occupied by overwritten or deleted records.
    fn dead_ratio(&self) -> f64 {
        0.0
    }

    /// Drop dead records. Backends without dead space return `None`.
    fn compact(&self) -> StoreResult<Option<CompactionReport>> {
        Ok(None)
    }
}
