//! Task executors used by transfer managers and run collectors
//!
//! [`BoundedExecutor`] is a fixed worker pool fed through a bounded channel.
//! [`ContextExecutor`] decorates any executor so that tasks run under the
//! call context of the thread that submitted them.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

use crate::context::CallContextTracker;

/// Unit of work submitted to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskExecutor: Send + Sync {
    fn submit(&self, task: Task);
}

/// Fixed-size worker pool
///
/// `submit` blocks once `capacity` tasks are waiting. Dropping the executor
/// lets the queued tasks finish and joins every worker.
pub struct BoundedExecutor {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl BoundedExecutor {
    /// # Panics
    ///
    /// Panics if `max_workers` is 0.
    pub fn new(max_workers: usize) -> Self {
        Self::with_capacity(max_workers, max_workers * 4)
    }

    pub fn with_capacity(max_workers: usize, capacity: usize) -> Self {
        Self::named("arcee-transfer", max_workers, capacity)
    }

    /// Pool whose threads are called `{name}-{index}`
    pub fn named(name: &str, max_workers: usize, capacity: usize) -> Self {
        assert!(max_workers > 0, "executor needs at least one worker");

        let (sender, receiver) = channel::bounded::<Task>(capacity.max(1));
        let workers = (0..max_workers)
            .map(|index| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                                tracing::warn!(worker = index, "pool task panicked");
                            }
                        }
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    tracing::warn!(pool = name, %err, "failed to spawn pool worker");
                    None
                }
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

impl TaskExecutor for BoundedExecutor {
    fn submit(&self, task: Task) {
        if self.workers.is_empty() {
            // no pool to hand the task to
            task();
            return;
        }
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(err) = sender.send(task) {
            tracing::warn!("pool closed, running task inline");
            (err.into_inner())();
        }
    }
}

impl Drop for BoundedExecutor {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("pool worker exited abnormally");
            }
        }
    }
}

/// Runs tasks under the submitting thread's call context
pub struct ContextExecutor {
    inner: Arc<dyn TaskExecutor>,
    tracker: Arc<CallContextTracker>,
}

impl ContextExecutor {
    pub fn new(inner: Arc<dyn TaskExecutor>, tracker: Arc<CallContextTracker>) -> Self {
        Self { inner, tracker }
    }
}

impl TaskExecutor for ContextExecutor {
    fn submit(&self, task: Task) {
        match self.tracker.propagate() {
            Some(context) => {
                let tracker = Arc::clone(&self.tracker);
                self.inner.submit(Box::new(move || {
                    let _scope = context.enter(&tracker);
                    task();
                }));
            }
            None => self.inner.submit(task),
        }
    }
}
