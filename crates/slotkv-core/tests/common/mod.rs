//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use slotkv_core::{
    Backend, ClockTime, CompactionReport, Config, HashDb, Storage, StoreError, StoreResult,
    encode_value,
};
use tempfile::TempDir;

/// Route test logs through the test harness. `RUST_LOG=slotkv_core=trace` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Storage over a fresh table in a temp directory.
pub fn open_storage(config: Config) -> (Storage, TempDir) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path().join("node.skv"), config).unwrap();
    (storage, dir)
}

/// Raw key with an explicit routing digest.
///
/// Keys built with the same digest land in the same slot and bucket.
pub fn raw_key(digest: u64, name: &str) -> Vec<u8> {
    let mut key = digest.to_le_bytes().to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn value(ct: u64, payload: &[u8]) -> Vec<u8> {
    encode_value(ClockTime::new(ct), payload)
}

/// `HashDb` wrapper whose writes or syncs can be made to fail on demand.
pub struct FaultyBackend {
    inner: HashDb,
    fail_writes: AtomicBool,
    fail_sync: AtomicBool,
    rejected: AtomicU64,
    syncs: AtomicU64,
}

impl FaultyBackend {
    pub fn open(path: &Path, config: &Config) -> StoreResult<Self> {
        Ok(Self {
            inner: HashDb::open(path, config)?,
            fail_writes: AtomicBool::new(false),
            fail_sync: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    pub fn set_sync_failing(&self, failing: bool) {
        self.fail_sync.store(failing, Ordering::SeqCst);
    }

    /// Successful syncs so far.
    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Writes refused while failing.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Io {
                path: None,
                kind: std::io::ErrorKind::Other,
                message: "injected write failure".to_string(),
            });
        }
        Ok(())
    }
}

impl Backend for FaultyBackend {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn get_into(&self, key: &[u8], buf: &mut [u8]) -> StoreResult<Option<usize>> {
        self.inner.get_into(key, buf)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.check()?;
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete(key)
    }

    fn value_size(&self, key: &[u8]) -> StoreResult<Option<usize>> {
        self.inner.value_size(key)
    }

    fn sync(&self) -> StoreResult<()> {
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: None,
                kind: std::io::ErrorKind::Other,
                message: "injected sync failure".to_string(),
            });
        }
        self.inner.sync()?;
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn copy_to(&self, dest: &Path) -> StoreResult<()> {
        self.inner.copy_to(dest)
    }

    fn record_count(&self) -> u64 {
        self.inner.record_count()
    }

    fn last_error(&self) -> Option<String> {
        self.inner.last_error()
    }

    fn keys(&self) -> StoreResult<Vec<Vec<u8>>> {
        self.inner.keys()
    }

    fn dead_ratio(&self) -> f64 {
        self.inner.dead_ratio()
    }

    fn compact(&self) -> StoreResult<Option<CompactionReport>> {
        self.inner.compact()
    }
}

/// Storage over a `FaultyBackend` in a temp directory.
pub fn open_faulty(config: Config) -> (Storage<FaultyBackend>, TempDir) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let db = FaultyBackend::open(&dir.path().join("node.skv"), &config).unwrap();
    let storage = Storage::with_backend(db, config).unwrap();
    (storage, dir)
}
