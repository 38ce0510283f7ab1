//! Per-thread call context tracking
//!
//! Records which instrumented call, if any, is running on each thread. The
//! outermost call owns the marker; nested calls only bump a counter. A call
//! made while a marker is present is "inside" another instrumented call and
//! must not be counted as a separate top-level operation.
//!
//! Work handed to a worker thread can carry the caller's context along via
//! [`CallContextTracker::propagate`] and [`TaskContext::enter`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, PartialEq, Eq)]
struct CallContext {
    method: String,
    depth: usize,
}

/// Outermost-call marker and re-entrancy counter per thread
#[derive(Debug, Default)]
pub struct CallContextTracker {
    threads: Mutex<HashMap<ThreadId, CallContext>>,
}

impl CallContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the current thread as running `method`
    ///
    /// The marker is kept if the thread is already inside a call. The
    /// returned scope undoes the entry when dropped, including during
    /// unwinding.
    pub fn enter(&self, method: &str) -> CallScope<'_> {
        let thread = thread::current().id();
        let mut threads = self.lock();
        threads
            .entry(thread)
            .and_modify(|ctx| ctx.depth += 1)
            .or_insert_with(|| CallContext {
                method: method.to_string(),
                depth: 1,
            });
        CallScope {
            tracker: self,
            thread,
        }
    }

    /// Outermost active method on this thread
    pub fn current(&self) -> Option<String> {
        self.lock()
            .get(&thread::current().id())
            .map(|ctx| ctx.method.clone())
    }

    /// Nesting depth on this thread, 0 outside any call
    pub fn depth(&self) -> usize {
        self.lock()
            .get(&thread::current().id())
            .map_or(0, |ctx| ctx.depth)
    }

    pub fn is_active(&self) -> bool {
        self.lock().contains_key(&thread::current().id())
    }

    /// Capture this thread's top-level call for a task run elsewhere
    pub fn propagate(&self) -> Option<TaskContext> {
        self.current().map(|method| TaskContext { method })
    }

    /// Threads currently inside an instrumented call
    pub fn active_threads(&self) -> usize {
        self.lock().len()
    }

    fn exit(&self, thread: ThreadId) {
        let mut threads = self.lock();
        if let Some(ctx) = threads.get_mut(&thread) {
            ctx.depth -= 1;
            if ctx.depth == 0 {
                threads.remove(&thread);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, CallContext>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Active entry in a [`CallContextTracker`]
#[must_use = "dropping the scope ends the tracked call"]
#[derive(Debug)]
pub struct CallScope<'a> {
    tracker: &'a CallContextTracker,
    thread: ThreadId,
}

impl Drop for CallScope<'_> {
    fn drop(&mut self) {
        self.tracker.exit(self.thread);
    }
}

/// Top-level call identity carried onto a worker thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    method: String,
}

impl TaskContext {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Re-establish the captured call on the current thread
    pub fn enter<'a>(&self, tracker: &'a CallContextTracker) -> CallScope<'a> {
        tracker.enter(&self.method)
    }
}
