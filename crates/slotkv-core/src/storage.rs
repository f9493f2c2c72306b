//! Storage node core — the sharded write-back cache in front of the backend.
//!
//! `Storage` routes each raw key to one shard (low half of its digest) and one
//! bucket inside it (high half), and runs every operation under a global
//! reader-writer lock:
//!
//! **Normal path**: shared lock, then the shard's own mutex. Different shards
//! progress in parallel.
//! **Contention path**: a shard reports that the bucket is pinned by a dirty
//! entry for another key. The caller trades the shared lock for the exclusive
//! one, flushes every shard, and retries from the top.
//! **Flush / copy / compact / cursor**: exclusive lock, stop-the-world.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{debug, error, trace, warn};

use crate::backend::{Backend, CompactionReport};
use crate::clock::ClockTime;
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::format;
use crate::hashdb::HashDb;
use crate::slot::{Attempt, Deletion, FlushReport, Lookup, Slot};

/// Counters describing write-back activity since the storage was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Flushes run
    pub cycles: u64,
    /// Values written to the backend
    pub written: u64,
    /// Keys removed from the backend
    pub deleted: u64,
    /// Write-backs that failed
    pub failed: u64,
}

#[derive(Default)]
struct FlushCounters {
    cycles: AtomicU64,
    written: AtomicU64,
    deleted: AtomicU64,
    failed: AtomicU64,
}

impl FlushCounters {
    fn record(&self, report: &FlushReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.written.fetch_add(report.written, Ordering::Relaxed);
        self.deleted.fetch_add(report.deleted, Ordering::Relaxed);
        self.failed.fetch_add(report.failed.len() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> FlushStats {
        FlushStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Sharded write-back cache over a [`Backend`].
///
/// All public methods take `&self`; share it across worker threads with `Arc`.
pub struct Storage<B: Backend = HashDb> {
    slots: Box<[Slot]>,
    global: RwLock<()>,
    /// Hint that some entry may be dirty or a sync is pending. Set after every
    /// accepted write, cleared only by a complete flush under the exclusive lock.
    dirty_exist: AtomicBool,
    /// Backend writes made by a flush but not yet synced. Cleared only by a
    /// successful sync, so a failed sync is retried by the next flush.
    needs_sync: AtomicBool,
    db: B,
    stats: FlushCounters,
    config: Config,
}

impl Storage<HashDb> {
    /// Open (or create) the on-disk table at `path` and put a cache in front of it.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> StoreResult<Self> {
        config.validate()?;
        let db = HashDb::open(path, &config)?;
        Self::with_backend(db, config)
    }
}

impl<B: Backend> Storage<B> {
    /// Put a cache in front of an already opened backend.
    pub fn with_backend(db: B, config: Config) -> StoreResult<Self> {
        config.validate()?;
        let slots = (0..config.slots_size)
            .map(|_| Slot::new(config.entries_size, config.initial_buffer_size, config.buffer_limit()))
            .collect();
        Ok(Self {
            slots,
            global: RwLock::new(()),
            dirty_exist: AtomicBool::new(false),
            needs_sync: AtomicBool::new(false),
            db,
            stats: FlushCounters::default(),
            config,
        })
    }

    /// Shard selected by the low half of the key digest.
    fn route(&self, raw_key: &[u8]) -> StoreResult<(&Slot, u64)> {
        let digest = format::digest_of(raw_key)?;
        let slot = &self.slots[(digest as u32 as usize) % self.slots.len()];
        Ok((slot, digest))
    }

    /// Attempt → (NeedsFlush) → flush everything → Attempt.
    ///
    /// With a single writer the second attempt always succeeds. Concurrent
    /// writers may dirty the bucket again in between, so the loop is not
    /// capped; each round trip still makes global progress by flushing.
    fn with_retry<T, F>(&self, raw_key: &[u8], mut op: F) -> StoreResult<T>
    where
        F: FnMut(&Slot, u64) -> StoreResult<Attempt<T>>,
    {
        let mut rounds = 0u32;
        loop {
            {
                let _shared = self.global.read();
                let (slot, digest) = self.route(raw_key)?;
                if let Attempt::Done(out) = op(slot, digest)? {
                    return Ok(out);
                }
            }

            rounds += 1;
            trace!(rounds, "bucket pinned by a dirty entry, flushing before retry");
            let exclusive = self.global.write();
            self.flush_locked(&exclusive)?;
        }
    }

    /// Current value of `raw_key`, clocktime prefix included.
    ///
    /// `None` when the key is unknown or deleted. The returned bytes stay
    /// valid regardless of what the cache does afterwards.
    pub fn get(&self, raw_key: &[u8]) -> StoreResult<Option<Bytes>> {
        format::check_key(raw_key, self.config.max_key_size)?;
        let lookup = self.with_retry(raw_key, |slot, digest| slot.get(raw_key, digest, &self.db))?;
        Ok(match lookup {
            Lookup::Found(value) => Some(value),
            Lookup::Tombstone | Lookup::Missing => None,
        })
    }

    /// Store `raw_value` (clocktime prefix + payload) under `raw_key`.
    ///
    /// Returns `false` when a newer write to the key is already known.
    pub fn update(&self, raw_key: &[u8], raw_value: &[u8]) -> StoreResult<bool> {
        format::check_key(raw_key, self.config.max_key_size)?;
        format::check_value(raw_value, self.config.max_value_size)?;
        self.with_retry(raw_key, |slot, digest| {
            let attempt = slot.update(raw_key, digest, raw_value, &self.db)?;
            if let Attempt::Done(true) = attempt {
                // still under the shared lock: visible to the next flush
                self.dirty_exist.store(true, Ordering::Release);
            }
            Ok(attempt)
        })
    }

    /// Delete `raw_key` unless its current value is newer than `clocktime`.
    ///
    /// The returned [`Deletion`] carries the clocktime the delete was checked
    /// against, when the key was found.
    pub fn del(&self, raw_key: &[u8], clocktime: ClockTime) -> StoreResult<Deletion> {
        format::check_key(raw_key, self.config.max_key_size)?;
        self.with_retry(raw_key, |slot, digest| {
            let attempt = slot.del(raw_key, digest, clocktime, &self.db)?;
            if let Attempt::Done(Deletion { deleted: true, .. }) = attempt {
                self.dirty_exist.store(true, Ordering::Release);
            }
            Ok(attempt)
        })
    }

    /// Write every dirty entry back to the backend, then sync it.
    ///
    /// On partial failure the failed entries stay dirty, the dirty hint stays
    /// set, and `StoreError::PartialFlush` lists their keys.
    pub fn flush(&self) -> StoreResult<FlushReport> {
        let exclusive = self.global.write();
        self.flush_locked(&exclusive)
    }

    /// Flush only if some entry may be dirty. `None` when nothing was done.
    pub fn try_flush(&self) -> StoreResult<Option<FlushReport>> {
        if !self.dirty_exist.load(Ordering::Acquire) {
            return Ok(None);
        }
        self.flush().map(Some)
    }

    fn flush_locked(&self, _exclusive: &RwLockWriteGuard<'_, ()>) -> StoreResult<FlushReport> {
        let mut report = FlushReport::default();
        for slot in self.slots.iter() {
            slot.flush(&self.db, &mut report);
        }
        self.stats.record(&report);

        if report.touched() {
            self.needs_sync.store(true, Ordering::Release);
        }
        if self.needs_sync.load(Ordering::Acquire) {
            if let Err(e) = self.db.sync() {
                // entries are already clean; keep the hint so try_flush comes back
                self.dirty_exist.store(true, Ordering::Release);
                warn!(error = %e, "backend sync after flush failed");
                return Err(e);
            }
            self.needs_sync.store(false, Ordering::Release);
        }

        if !report.failed.is_empty() {
            let reason = report.first_error.clone().unwrap_or_default();
            warn!(
                failed = report.failed.len(),
                written = report.written,
                deleted = report.deleted,
                reason = %reason,
                "flush left entries dirty"
            );
            return Err(StoreError::PartialFlush { failed: report.failed, reason });
        }

        self.dirty_exist.store(false, Ordering::Release);
        if report.touched() {
            debug!(written = report.written, deleted = report.deleted, "flushed dirty entries");
        }
        Ok(report)
    }

    /// Flush, then write a consistent snapshot of the backend to `dest`.
    pub fn copy<P: AsRef<Path>>(&self, dest: P) -> StoreResult<()> {
        let exclusive = self.global.write();
        self.flush_locked(&exclusive)?;
        self.db.copy_to(dest.as_ref()).map_err(|e| {
            error!(dest = %dest.as_ref().display(), error = %e, "copy failed");
            e
        })
    }

    /// Flush, then let the backend drop its dead records.
    pub fn compact(&self) -> StoreResult<Option<CompactionReport>> {
        let exclusive = self.global.write();
        self.flush_locked(&exclusive)?;
        self.db.compact()
    }

    /// Whether the backend's dead space exceeds `compaction_trigger_ratio`.
    pub fn needs_compaction(&self) -> bool {
        self.db.dead_ratio() > self.config.compaction_trigger_ratio
    }

    /// Records in the backend. Writes still waiting in the cache are not counted.
    pub fn record_count(&self) -> u64 {
        let _shared = self.global.read();
        self.db.record_count()
    }

    /// Last backend error message, for diagnostics.
    pub fn last_error(&self) -> Option<String> {
        self.db.last_error()
    }

    /// Whether some entry may be dirty.
    pub fn is_dirty(&self) -> bool {
        self.dirty_exist.load(Ordering::Acquire)
    }

    /// Exact number of dirty entries across all shards.
    pub fn dirty_entries(&self) -> usize {
        let _shared = self.global.read();
        self.slots.iter().map(Slot::dirty_count).sum()
    }

    /// Write-back counters.
    pub fn stats(&self) -> FlushStats {
        self.stats.snapshot()
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Underlying backend.
    pub fn backend(&self) -> &B {
        &self.db
    }

    /// Visit every record in the backend.
    ///
    /// Runs under the exclusive lock after a full flush, so the backend is
    /// authoritative for the whole walk. Records deleted through the cursor
    /// are also dropped from the cache.
    pub fn for_each<F>(&self, mut visit: F) -> StoreResult<()>
    where
        F: FnMut(&mut Cursor<'_, B>) -> StoreResult<()>,
    {
        let exclusive = self.global.write();
        self.flush_locked(&exclusive)?;

        let mut removed_any = false;
        for key in self.db.keys()? {
            let Some(value) = self.db.get(&key)? else { continue };
            let mut cursor = Cursor { db: &self.db, key, value, removed: false };
            visit(&mut cursor)?;

            if cursor.removed {
                removed_any = true;
                if let Ok((slot, digest)) = self.route(&cursor.key) {
                    slot.invalidate(&cursor.key, digest);
                }
            }
        }

        if removed_any {
            self.db.sync()?;
        }
        Ok(())
    }
}

/// A record visited by [`Storage::for_each`].
pub struct Cursor<'a, B: Backend> {
    db: &'a B,
    key: Vec<u8>,
    value: Vec<u8>,
    removed: bool,
}

impl<B: Backend> Cursor<'_, B> {
    /// Raw key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Raw value, clocktime prefix included.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Clocktime of the stored value, if it carries one.
    pub fn clocktime(&self) -> Option<ClockTime> {
        ClockTime::from_prefix(&self.value)
    }

    /// Delete the record unless it is newer than `clocktime`.
    pub fn del(&mut self, clocktime: ClockTime) -> StoreResult<bool> {
        match self.clocktime() {
            Some(stored) if clocktime.accepts_over(stored) => self.del_nocheck(),
            _ => Ok(false),
        }
    }

    /// Delete the record regardless of its clocktime.
    pub fn del_nocheck(&mut self) -> StoreResult<bool> {
        if self.removed {
            return Ok(false);
        }
        let deleted = self.db.delete(&self.key)?;
        self.removed = deleted;
        Ok(deleted)
    }
}
