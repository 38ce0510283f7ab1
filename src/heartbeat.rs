//! Periodic background callback
//!
//! Runs a callback on a dedicated thread every `period` until stopped. The
//! callback runs once immediately after spawning. Stopping wakes the thread
//! early, so `stop()` returns after at most one in-flight callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub struct Heartbeat {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    beats: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn spawn<F>(period: Duration, mut callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let beats = Arc::new(AtomicU64::new(0));

        let shutdown_clone = Arc::clone(&shutdown);
        let beats_clone = Arc::clone(&beats);
        let spawned = thread::Builder::new()
            .name("arcee-heartbeat".to_string())
            .spawn(move || {
                while !shutdown_clone.load(Ordering::Acquire) {
                    callback();
                    beats_clone.fetch_add(1, Ordering::Relaxed);
                    Self::sleep(period, &shutdown_clone);
                }
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(%err, "failed to spawn heartbeat thread");
                None
            }
        };

        Self {
            handle,
            shutdown,
            beats,
        }
    }

    /// Wait for `period` or until shutdown is requested
    fn sleep(period: Duration, shutdown: &AtomicBool) {
        let deadline = Instant::now() + period;
        while !shutdown.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }

    /// Completed callback runs
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::warn!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("beats", &self.beats())
            .field("running", &self.is_running())
            .finish()
    }
}
