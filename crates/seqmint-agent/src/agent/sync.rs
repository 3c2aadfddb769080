//! # Background fsync task
//!
//! The dispatcher writes the sequence block synchronously but never waits on
//! `fdatasync`; a dedicated thread flushes the file once per second, or
//! sooner when the dispatcher signals that a full reservation of values went
//! out since the last flush.
//!
//! The thread shares exactly three things with the dispatcher: the open file,
//! the uncommitted counter, and the wake event. If `fdatasync` itself fails
//! the process exits; the durability contract cannot be kept after that.

use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

const FLUSH_TICK: Duration = Duration::from_secs(1);

/// State shared between the dispatcher and the fsync thread.
#[derive(Debug, Default)]
pub struct SyncShared {
    uncommitted: AtomicU32,
    stop: AtomicBool,
    wake: Mutex<bool>,
    cond: Condvar,
}

impl SyncShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records `n` freshly issued values; wakes the flusher early once a full
    /// `steps` worth accumulated.
    pub fn note_issued(&self, n: u32, steps: u32) {
        let total = self.uncommitted.fetch_add(n, Ordering::Relaxed) + n;
        if total >= steps {
            self.flush_soon();
        }
    }

    /// Resets the uncommitted counter and wakes the flusher.
    pub fn flush_soon(&self) {
        self.uncommitted.store(0, Ordering::Relaxed);
        self.signal();
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.signal();
    }

    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn signal(&self) {
        let mut woken = self
            .wake
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *woken = true;
        self.cond.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut woken = self
            .wake
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !*woken {
            let (guard, _timeout) = self
                .cond
                .wait_timeout(woken, timeout)
                .unwrap_or_else(PoisonError::into_inner);
            woken = guard;
        }
        *woken = false;
    }
}

/// Handle to the running fsync thread.
pub struct SyncTask {
    shared: Arc<SyncShared>,
    handle: Option<JoinHandle<()>>,
}

impl SyncTask {
    /// Spawns the flusher over the (already open) sequence file.
    pub fn spawn(file: Arc<File>, shared: Arc<SyncShared>) -> Self {
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("seqmint-fsync".into())
            .spawn(move || flush_loop(&file, &thread_shared))
            .expect("failed to spawn the fsync thread");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Stops the thread and waits for it to finish its final flush.
    pub fn stop(mut self) {
        self.shared.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn flush_loop(file: &File, shared: &SyncShared) {
    while !shared.stopping() {
        shared.wait(FLUSH_TICK);
        if shared.stopping() {
            break;
        }
        if let Err(err) = file.sync_data() {
            tracing::error!(%err, "fdatasync of the sequence file failed");
            std::process::exit(1);
        }
    }
    // One last flush on the way out so a clean shutdown loses nothing.
    if let Err(err) = file.sync_data() {
        tracing::error!(%err, "final fdatasync of the sequence file failed");
    }
    tracing::debug!("fsync thread stopped");
}
