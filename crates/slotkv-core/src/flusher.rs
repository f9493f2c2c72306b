//! Background flusher — periodic write-back from the cache to the backend.
//!
//! Every `flush_cadence` the flusher calls [`Storage::try_flush`], which is a
//! no-op while nothing is dirty. When the backend's dead space passes the
//! configured ratio it also compacts. A final flush runs on shutdown so a
//! clean stop never leaves dirty entries behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::backend::Backend;
use crate::error::{StoreError, StoreResult};
use crate::storage::Storage;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Handle to a running flusher thread.
/// Dropping this handle signals the thread to stop.
pub struct FlusherHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FlusherHandle {
    /// Request shutdown and wait for the final flush to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Whether the background thread is still alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlusherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start flushing `storage` in the background at its configured cadence.
pub fn start_flusher<B: Backend + 'static>(storage: Arc<Storage<B>>) -> StoreResult<FlusherHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    let cadence = storage.config().flush_cadence;

    let thread = thread::Builder::new()
        .name("slotkv-flusher".to_string())
        .spawn(move || flush_loop(&storage, cadence, &shutdown_clone))
        .map_err(|e| StoreError::Io {
            path: None,
            kind: e.kind(),
            message: format!("Failed to spawn flusher thread: {}", e),
        })?;

    info!(cadence_ms = cadence.as_millis() as u64, "flusher started");
    Ok(FlusherHandle { shutdown, thread: Some(thread) })
}

fn flush_loop<B: Backend>(storage: &Storage<B>, cadence: Duration, shutdown: &AtomicBool) {
    loop {
        let wake_time = Instant::now() + cadence;
        while Instant::now() < wake_time {
            if shutdown.load(Ordering::Acquire) {
                run_cycle(storage, false);
                info!("flusher stopped");
                return;
            }
            thread::sleep(SHUTDOWN_POLL.min(cadence));
        }
        run_cycle(storage, true);
    }
}

fn run_cycle<B: Backend>(storage: &Storage<B>, allow_compaction: bool) {
    if let Err(e) = storage.try_flush() {
        // failed entries stay dirty and are retried next cycle
        warn!(error = %e, "background flush failed");
        return;
    }

    if allow_compaction && storage.needs_compaction() {
        match storage.compact() {
            Ok(Some(report)) => info!(
                live_records = report.live_records,
                bytes_saved = report.bytes_saved(),
                "compacted backend"
            ),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "background compaction failed"),
        }
    }
}
