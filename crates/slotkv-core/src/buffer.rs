//! Growable, reference-counted byte arena owned by one shard.
//!
//! Records are carved off the front of a `BytesMut` and frozen into `Bytes`
//! handles. A handle keeps its backing allocation alive on its own, so a
//! reader that got a value from the cache never observes the arena growing,
//! being reused, or the entry being evicted afterwards. Once every handle into
//! an allocation is gone the memory is released (or reclaimed in place by the
//! next `reserve`).

use bytes::{Bytes, BytesMut};

use crate::error::{StoreError, StoreResult};

/// Per-shard byte arena.
#[derive(Debug)]
pub struct SharedBuffer {
    buf: BytesMut,
    init_size: usize,
    limit: usize,
}

impl SharedBuffer {
    /// Empty arena. Nothing is allocated until the first `reserve`.
    pub fn new(init_size: usize, limit: usize) -> Self {
        Self { buf: BytesMut::new(), init_size, limit: limit.max(init_size) }
    }

    /// Contiguous bytes available for the next record.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Ensure at least `size` free bytes, doubling from the current
    /// reservation (or `init_size`) until it fits. Never shrinks.
    pub fn reserve(&mut self, size: usize) -> StoreResult<()> {
        if self.buf.capacity() >= size {
            return Ok(());
        }
        if size > self.limit {
            return Err(StoreError::BufferExhausted { requested: size, limit: self.limit });
        }

        let mut target = self.buf.capacity().max(self.init_size);
        while target < size {
            target = target.saturating_mul(2);
        }
        self.buf.reserve(target.min(self.limit));
        Ok(())
    }

    /// Copy `parts` back to back into the arena and return a shared view of them.
    pub fn allocate(&mut self, parts: &[&[u8]]) -> StoreResult<Bytes> {
        let total = parts.iter().map(|p| p.len()).sum();
        self.reserve(total)?;
        for part in parts {
            self.buf.extend_from_slice(part);
        }
        Ok(self.buf.split().freeze())
    }

    /// Stage `prefix`, then let `fill` write into a window of at most
    /// `max_len` bytes after it.
    ///
    /// Only the window is initialised, however much spare capacity the arena
    /// holds. `fill` reports how many bytes it produced, or `None` to abandon
    /// the record; abandoned bytes stay in the arena for the next caller.
    pub fn fill_after<F>(&mut self, prefix: &[u8], max_len: usize, fill: F) -> StoreResult<Option<Bytes>>
    where
        F: FnOnce(&mut [u8]) -> StoreResult<Option<usize>>,
    {
        debug_assert!(self.buf.is_empty());
        let room = self.buf.capacity().max(prefix.len()).min(prefix.len() + max_len);
        self.buf.extend_from_slice(prefix);
        self.buf.resize(room, 0);

        let produced = match fill(&mut self.buf[prefix.len()..]) {
            Ok(Some(n)) => n.min(room - prefix.len()),
            Ok(None) => {
                self.buf.clear();
                return Ok(None);
            }
            Err(e) => {
                self.buf.clear();
                return Err(e);
            }
        };

        self.buf.truncate(prefix.len() + produced);
        Ok(Some(self.buf.split().freeze()))
    }
}
