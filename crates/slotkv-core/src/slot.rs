//! A shard of the cache: a direct-mapped array of entries behind one mutex.
//!
//! Each bucket holds at most one key. A clean bucket may be repurposed for a
//! different key at any time; a dirty one may not, because its write has not
//! reached the backend yet. In that case the operation answers
//! [`Attempt::NeedsFlush`] and the caller flushes before retrying.

use bytes::Bytes;
use parking_lot::Mutex;

use crate::backend::Backend;
use crate::buffer::SharedBuffer;
use crate::clock::{ClockTime, CLOCKTIME_SIZE};
use crate::error::StoreResult;
use crate::format::{self, VALUE_META_SIZE};

/// Write-back state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Matches the backend (or holds nothing)
    Clean,
    /// Holds a value not yet written to the backend
    DirtySet,
    /// Tombstone: the key must be removed from the backend
    DirtyDelete,
}

/// One cache line: a raw key and its raw value stored contiguously.
#[derive(Debug, Clone)]
pub struct Entry {
    record: Bytes,
    keylen: usize,
    state: EntryState,
}

impl Entry {
    fn empty() -> Self {
        Self { record: Bytes::new(), keylen: 0, state: EntryState::Clean }
    }

    fn is_empty(&self) -> bool {
        self.record.is_empty()
    }

    fn key(&self) -> &[u8] {
        &self.record[..self.keylen]
    }

    fn value(&self) -> Bytes {
        self.record.slice(self.keylen..)
    }

    fn key_equals(&self, raw_key: &[u8]) -> bool {
        !self.is_empty() && self.key() == raw_key
    }

    fn clocktime(&self) -> ClockTime {
        ClockTime::from_prefix(&self.record[self.keylen..]).unwrap_or_default()
    }

    fn is_dirty(&self) -> bool {
        self.state != EntryState::Clean
    }
}

/// Result of a shard-level operation.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The operation completed with this outcome
    Done(T),
    /// The bucket is held by a different, dirty key; flush and retry
    NeedsFlush,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Current value (clocktime prefix included)
    Found(Bytes),
    /// Deleted, delete not yet flushed
    Tombstone,
    /// Neither cached nor stored
    Missing,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deletion {
    /// Whether a tombstone was recorded
    pub deleted: bool,
    /// Clocktime of the record the delete was checked against
    pub prior: Option<ClockTime>,
}

/// Accumulated result of flushing shards.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Values written to the backend
    pub written: u64,
    /// Keys removed from the backend
    pub deleted: u64,
    /// Keys whose write-back failed; their entries stay dirty
    pub failed: Vec<Vec<u8>>,
    /// First failure message
    pub first_error: Option<String>,
}

impl FlushReport {
    /// Whether any backend write was attempted.
    pub fn touched(&self) -> bool {
        self.written + self.deleted > 0 || !self.failed.is_empty()
    }

    fn record_failure(&mut self, key: &[u8], err: String) {
        self.failed.push(key.to_vec());
        self.first_error.get_or_insert(err);
    }
}

struct SlotInner {
    entries: Box<[Entry]>,
    buffer: SharedBuffer,
}

/// Independently locked partition of the cache.
pub struct Slot {
    inner: Mutex<SlotInner>,
    entries_size: usize,
    init_size: usize,
}

impl Slot {
    /// Shard with `entries_size` empty buckets.
    pub fn new(entries_size: usize, init_size: usize, buffer_limit: usize) -> Self {
        let entries = (0..entries_size).map(|_| Entry::empty()).collect();
        Self {
            inner: Mutex::new(SlotInner {
                entries,
                buffer: SharedBuffer::new(init_size, buffer_limit),
            }),
            entries_size,
            init_size,
        }
    }

    /// Bucket selected by the high half of the key digest.
    fn bucket_of(&self, digest: u64) -> usize {
        ((digest >> 32) as u32 as usize) % self.entries_size
    }

    /// Look `raw_key` up, loading it from `db` on a miss.
    pub fn get<B: Backend + ?Sized>(
        &self,
        raw_key: &[u8],
        digest: u64,
        db: &B,
    ) -> StoreResult<Attempt<Lookup>> {
        let mut inner = self.inner.lock();
        let idx = self.bucket_of(digest);

        let e = &inner.entries[idx];
        if e.key_equals(raw_key) {
            if e.state == EntryState::DirtyDelete {
                return Ok(Attempt::Done(Lookup::Tombstone));
            }
            return Ok(Attempt::Done(Lookup::Found(e.value())));
        }

        if e.is_dirty() {
            return Ok(Attempt::NeedsFlush);
        }

        if !self.load(&mut inner, idx, raw_key, db)? {
            return Ok(Attempt::Done(Lookup::Missing));
        }
        Ok(Attempt::Done(Lookup::Found(inner.entries[idx].value())))
    }

    /// Store `raw_value` for `raw_key` unless a newer clocktime is known.
    ///
    /// `Done(false)` means the write was stale and dropped.
    pub fn update<B: Backend + ?Sized>(
        &self,
        raw_key: &[u8],
        digest: u64,
        raw_value: &[u8],
        db: &B,
    ) -> StoreResult<Attempt<bool>> {
        let clocktime = format::clocktime_of(raw_value)?;
        let mut inner = self.inner.lock();
        let idx = self.bucket_of(digest);

        let e = &inner.entries[idx];
        if e.key_equals(raw_key) {
            if !clocktime.accepts_over(e.clocktime()) {
                return Ok(Attempt::Done(false));
            }
        } else {
            if let Some(stored) = stored_clocktime(db, raw_key)? {
                if !clocktime.accepts_over(stored) {
                    return Ok(Attempt::Done(false));
                }
            }
            if e.is_dirty() {
                return Ok(Attempt::NeedsFlush);
            }
        }

        // readers may still hold the previous record; write a fresh one
        let record = inner.buffer.allocate(&[raw_key, raw_value])?;
        inner.entries[idx] = Entry { record, keylen: raw_key.len(), state: EntryState::DirtySet };
        Ok(Attempt::Done(true))
    }

    /// Tombstone `raw_key` unless its current record is newer than `clocktime`.
    pub fn del<B: Backend + ?Sized>(
        &self,
        raw_key: &[u8],
        digest: u64,
        clocktime: ClockTime,
        db: &B,
    ) -> StoreResult<Attempt<Deletion>> {
        let mut inner = self.inner.lock();
        let idx = self.bucket_of(digest);

        let e = &inner.entries[idx];
        if e.key_equals(raw_key) {
            if e.state == EntryState::DirtyDelete {
                return Ok(Attempt::Done(Deletion { deleted: false, prior: None }));
            }
        } else {
            if e.is_dirty() {
                return Ok(Attempt::NeedsFlush);
            }
            if !self.load(&mut inner, idx, raw_key, db)? {
                return Ok(Attempt::Done(Deletion { deleted: false, prior: None }));
            }
        }

        let prior = inner.entries[idx].clocktime();
        if !clocktime.accepts_over(prior) {
            return Ok(Attempt::Done(Deletion { deleted: false, prior: Some(prior) }));
        }

        // the tombstone keeps the key and the delete's clocktime only
        let record = inner.buffer.allocate(&[raw_key, &clocktime.to_bytes()])?;
        inner.entries[idx] = Entry { record, keylen: raw_key.len(), state: EntryState::DirtyDelete };
        Ok(Attempt::Done(Deletion { deleted: true, prior: Some(prior) }))
    }

    /// Write every dirty entry back to `db`.
    ///
    /// Entries whose write fails stay dirty and are listed in `report`.
    /// Flushed tombstones are emptied so the bucket no longer claims the key.
    pub fn flush<B: Backend + ?Sized>(&self, db: &B, report: &mut FlushReport) {
        let mut inner = self.inner.lock();
        for e in inner.entries.iter_mut() {
            match e.state {
                EntryState::Clean => {}
                EntryState::DirtySet => match db.put(e.key(), &e.value()) {
                    Ok(()) => {
                        e.state = EntryState::Clean;
                        report.written += 1;
                    }
                    Err(err) => report.record_failure(e.key(), err.to_string()),
                },
                EntryState::DirtyDelete => match db.delete(e.key()) {
                    Ok(_) => {
                        *e = Entry::empty();
                        report.deleted += 1;
                    }
                    Err(err) => report.record_failure(e.key(), err.to_string()),
                },
            }
        }
    }

    /// Drop the cached copy of `raw_key` if it is clean.
    pub fn invalidate(&self, raw_key: &[u8], digest: u64) {
        let mut inner = self.inner.lock();
        let idx = self.bucket_of(digest);
        let e = &mut inner.entries[idx];
        if e.key_equals(raw_key) && !e.is_dirty() {
            *e = Entry::empty();
        }
    }

    /// Number of dirty entries.
    pub fn dirty_count(&self) -> usize {
        self.inner.lock().entries.iter().filter(|e| e.is_dirty()).count()
    }

    /// Read `raw_key` from `db` into bucket `idx`, replacing its clean contents.
    ///
    /// The value is read straight into an `init_size` window of the arena. If
    /// it may not have fit, the exact size is queried, the arena grown to it,
    /// and the read retried once with a window of exactly that size.
    fn load<B: Backend + ?Sized>(
        &self,
        inner: &mut SlotInner,
        idx: usize,
        raw_key: &[u8],
        db: &B,
    ) -> StoreResult<bool> {
        inner.buffer.reserve(raw_key.len() + self.init_size)?;

        let mut window_len = self.init_size;
        let mut retried = false;
        loop {
            let mut truncated = false;
            let record = inner.buffer.fill_after(raw_key, window_len, |window| {
                match db.get_into(raw_key, window)? {
                    Some(n) if n < VALUE_META_SIZE => Ok(None),
                    Some(n) if n == window.len() && !retried => {
                        truncated = true;
                        Ok(None)
                    }
                    Some(n) => Ok(Some(n)),
                    None => Ok(None),
                }
            })?;

            if let Some(record) = record {
                inner.entries[idx] = Entry { record, keylen: raw_key.len(), state: EntryState::Clean };
                return Ok(true);
            }
            if !truncated {
                return Ok(false);
            }

            match db.value_size(raw_key)? {
                Some(size) if size >= VALUE_META_SIZE => {
                    inner.buffer.reserve(raw_key.len() + size)?;
                    window_len = size;
                    retried = true;
                }
                _ => return Ok(false),
            }
        }
    }
}

/// Clocktime of the stored value, reading only its prefix.
fn stored_clocktime<B: Backend + ?Sized>(db: &B, raw_key: &[u8]) -> StoreResult<Option<ClockTime>> {
    let mut prefix = [0u8; CLOCKTIME_SIZE];
    match db.get_into(raw_key, &mut prefix)? {
        Some(n) if n == CLOCKTIME_SIZE => Ok(ClockTime::from_prefix(&prefix)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::format::{encode_key, encode_value};
    use crate::hashdb::HashDb;
    use tempfile::TempDir;

    fn fixture() -> (Slot, HashDb, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = HashDb::open(dir.path().join("slot.skv"), &Config::minimal()).unwrap();
        (Slot::new(4, 64, 1 << 20), db, dir)
    }

    /// Raw key with a chosen digest so tests control the bucket.
    fn key_in_bucket(bucket: u32, name: &[u8]) -> (Vec<u8>, u64) {
        let digest = (bucket as u64) << 32;
        let mut raw = digest.to_le_bytes().to_vec();
        raw.extend_from_slice(name);
        (raw, digest)
    }

    fn done<T: std::fmt::Debug>(attempt: Attempt<T>) -> T {
        match attempt {
            Attempt::Done(out) => out,
            Attempt::NeedsFlush => panic!("unexpected NeedsFlush"),
        }
    }

    #[test]
    fn test_update_then_get() {
        let (slot, db, _dir) = fixture();
        let key = encode_key(b"alpha");
        let digest = format::digest_of(&key).unwrap();
        let value = encode_value(ClockTime::new(1), b"one");

        assert!(done(slot.update(&key, digest, &value, &db).unwrap()));
        assert_eq!(done(slot.get(&key, digest, &db).unwrap()), Lookup::Found(Bytes::from(value)));
        assert_eq!(slot.dirty_count(), 1);
    }

    #[test]
    fn test_stale_update_rejected() {
        let (slot, db, _dir) = fixture();
        let (key, digest) = key_in_bucket(0, b"k");

        assert!(done(slot.update(&key, digest, &encode_value(ClockTime::new(5), b"v1"), &db).unwrap()));
        assert!(!done(slot.update(&key, digest, &encode_value(ClockTime::new(3), b"v2"), &db).unwrap()));
        assert!(done(slot.update(&key, digest, &encode_value(ClockTime::new(5), b"v3"), &db).unwrap()));

        let expected = Bytes::from(encode_value(ClockTime::new(5), b"v3"));
        assert_eq!(done(slot.get(&key, digest, &db).unwrap()), Lookup::Found(expected));
    }

    #[test]
    fn test_dirty_collision_needs_flush() {
        let (slot, db, _dir) = fixture();
        let (k1, d1) = key_in_bucket(2, b"first");
        let (k2, d2) = key_in_bucket(6, b"second"); // 6 % 4 == 2

        assert!(done(slot.update(&k1, d1, &encode_value(ClockTime::new(1), b"a"), &db).unwrap()));
        assert!(matches!(slot.get(&k2, d2, &db).unwrap(), Attempt::NeedsFlush));
        assert!(matches!(
            slot.update(&k2, d2, &encode_value(ClockTime::new(1), b"b"), &db).unwrap(),
            Attempt::NeedsFlush
        ));
        assert!(matches!(slot.del(&k2, d2, ClockTime::new(1), &db).unwrap(), Attempt::NeedsFlush));

        let mut report = FlushReport::default();
        slot.flush(&db, &mut report);
        assert_eq!(report.written, 1);
        assert_eq!(slot.dirty_count(), 0);

        assert!(done(slot.update(&k2, d2, &encode_value(ClockTime::new(1), b"b"), &db).unwrap()));
        assert_eq!(db.get(&k1).unwrap(), Some(encode_value(ClockTime::new(1), b"a")));
    }

    #[test]
    fn test_update_checks_stored_clock_on_miss() {
        let (slot, db, _dir) = fixture();
        let (key, digest) = key_in_bucket(1, b"persisted");
        db.put(&key, &encode_value(ClockTime::new(10), b"disk")).unwrap();

        assert!(!done(slot.update(&key, digest, &encode_value(ClockTime::new(9), b"old"), &db).unwrap()));
        assert!(done(slot.update(&key, digest, &encode_value(ClockTime::new(11), b"new"), &db).unwrap()));
    }

    #[test]
    fn test_delete_tombstone_lifecycle() {
        let (slot, db, _dir) = fixture();
        let (key, digest) = key_in_bucket(3, b"doomed");
        assert!(done(slot.update(&key, digest, &encode_value(ClockTime::new(4), b"v"), &db).unwrap()));

        let stale = done(slot.del(&key, digest, ClockTime::new(2), &db).unwrap());
        assert_eq!(stale, Deletion { deleted: false, prior: Some(ClockTime::new(4)) });

        let applied = done(slot.del(&key, digest, ClockTime::new(8), &db).unwrap());
        assert_eq!(applied, Deletion { deleted: true, prior: Some(ClockTime::new(4)) });
        assert_eq!(done(slot.get(&key, digest, &db).unwrap()), Lookup::Tombstone);

        // a second delete sees the tombstone
        let again = done(slot.del(&key, digest, ClockTime::new(9), &db).unwrap());
        assert!(!again.deleted);

        // an update older than the delete loses to the tombstone
        assert!(!done(slot.update(&key, digest, &encode_value(ClockTime::new(6), b"late"), &db).unwrap()));

        let mut report = FlushReport::default();
        slot.flush(&db, &mut report);
        assert_eq!(report.deleted, 1);
        assert_eq!(done(slot.get(&key, digest, &db).unwrap()), Lookup::Missing);
    }

    #[test]
    fn test_delete_missing_key() {
        let (slot, db, _dir) = fixture();
        let (key, digest) = key_in_bucket(0, b"nothing");
        let out = done(slot.del(&key, digest, ClockTime::new(1), &db).unwrap());
        assert_eq!(out, Deletion { deleted: false, prior: None });
    }

    #[test]
    fn test_load_grows_buffer_for_large_values() {
        let (slot, db, _dir) = fixture();
        let (key, digest) = key_in_bucket(1, b"big");
        let value = encode_value(ClockTime::new(1), &vec![0x5A; 10_000]);
        db.put(&key, &value).unwrap();

        assert_eq!(done(slot.get(&key, digest, &db).unwrap()), Lookup::Found(Bytes::from(value)));
    }

    /// Records the size of every bounded read it serves.
    struct WindowSpy {
        db: HashDb,
        windows: parking_lot::Mutex<Vec<usize>>,
    }

    impl Backend for WindowSpy {
        fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> { self.db.get(key) }
        fn get_into(&self, key: &[u8], buf: &mut [u8]) -> StoreResult<Option<usize>> {
            self.windows.lock().push(buf.len());
            self.db.get_into(key, buf)
        }
        fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> { self.db.put(key, value) }
        fn delete(&self, key: &[u8]) -> StoreResult<bool> { self.db.delete(key) }
        fn value_size(&self, key: &[u8]) -> StoreResult<Option<usize>> { self.db.value_size(key) }
        fn sync(&self) -> StoreResult<()> { self.db.sync() }
        fn copy_to(&self, dest: &std::path::Path) -> StoreResult<()> { self.db.copy_to(dest) }
        fn record_count(&self) -> u64 { self.db.record_count() }
        fn last_error(&self) -> Option<String> { self.db.last_error() }
        fn keys(&self) -> StoreResult<Vec<Vec<u8>>> { self.db.keys() }
    }

    #[test]
    fn test_miss_window_stays_small_after_large_load() {
        let (slot, db, _dir) = fixture();
        let spy = WindowSpy { db, windows: parking_lot::Mutex::new(Vec::new()) };

        let (big_key, big_digest) = key_in_bucket(1, b"big");
        let big = encode_value(ClockTime::new(1), &vec![0x5A; 200_000]);
        spy.put(&big_key, &big).unwrap();
        done(slot.get(&big_key, big_digest, &spy).unwrap());
        assert_eq!(spy.windows.lock().last().copied(), Some(big.len()));

        // the arena is now large; a later miss still reads through a small window
        spy.windows.lock().clear();
        let (small_key, small_digest) = key_in_bucket(1, b"small");
        let small = encode_value(ClockTime::new(1), b"tiny");
        spy.put(&small_key, &small).unwrap();
        assert_eq!(
            done(slot.get(&small_key, small_digest, &spy).unwrap()),
            Lookup::Found(Bytes::from(small))
        );
        assert_eq!(*spy.windows.lock(), vec![64]);
    }

    #[test]
    fn test_load_values_around_reservation_edges() {
        let (slot, db, _dir) = fixture();
        // sweep across the first few reservation sizes so some values land
        // exactly on the free window
        for len in 0..300usize {
            let (key, digest) = key_in_bucket(1, format!("edge{:03}", len).as_bytes());
            let value = encode_value(ClockTime::new(2), &vec![len as u8; len]);
            db.put(&key, &value).unwrap();

            assert_eq!(
                done(slot.get(&key, digest, &db).unwrap()),
                Lookup::Found(Bytes::from(value)),
                "payload length {}", len
            );
        }
    }

    #[test]
    fn test_reader_view_outlives_eviction() {
        let (slot, db, _dir) = fixture();
        let (k1, d1) = key_in_bucket(0, b"one");
        let (k2, d2) = key_in_bucket(4, b"two");
        let v1 = encode_value(ClockTime::new(1), b"first value");

        slot.update(&k1, d1, &v1, &db).unwrap();
        let view = match done(slot.get(&k1, d1, &db).unwrap()) {
            Lookup::Found(v) => v,
            other => panic!("unexpected {:?}", other),
        };

        let mut report = FlushReport::default();
        slot.flush(&db, &mut report);
        slot.update(&k2, d2, &encode_value(ClockTime::new(1), b"second"), &db).unwrap();

        assert_eq!(&view[..], &v1[..]);
    }

    #[test]
    fn test_invalidate_only_clean() {
        let (slot, db, _dir) = fixture();
        let (key, digest) = key_in_bucket(0, b"k");
        slot.update(&key, digest, &encode_value(ClockTime::new(1), b"v"), &db).unwrap();

        slot.invalidate(&key, digest);
        assert_eq!(slot.dirty_count(), 1);

        let mut report = FlushReport::default();
        slot.flush(&db, &mut report);
        slot.invalidate(&key, digest);
        db.delete(&key).unwrap();
        assert_eq!(done(slot.get(&key, digest, &db).unwrap()), Lookup::Missing);
    }
}
