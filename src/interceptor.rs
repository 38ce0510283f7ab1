//! Call interception and classification
//!
//! A [`MethodInterceptor`] sits between a decorating client and the wrapped
//! implementation. For each call it:
//!
//! 1. classifies the call ([`CallKind`]) before anything runs,
//! 2. enters the shared [`CallContextTracker`] scope and its own re-entry
//!    token, then runs the original,
//! 3. on success records a method tally for top-level calls and dispatches
//!    the per-method handler.
//!
//! Failed calls return their error unchanged and record nothing.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::context::CallContextTracker;
use crate::stats::Recorder;

/// A call description the interceptor can dispatch on
pub trait InterceptedCall {
    /// Method name used for tallies and handler lookup
    fn method(&self) -> &str;
}

/// Where an intercepted call sits relative to other instrumented calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallKind {
    /// The thread was already inside an instrumented call (possibly one
    /// propagated from another thread)
    pub inside_call: bool,
    /// This same interceptor was already active on the thread
    pub rewrapped: bool,
}

impl CallKind {
    pub const TOP_LEVEL: CallKind = CallKind {
        inside_call: false,
        rewrapped: false,
    };

    pub fn is_top_level(self) -> bool {
        !self.inside_call && !self.rewrapped
    }
}

/// Per-method recording callback, run after a successful call
pub type Handler<C> = fn(&Recorder, &str, &C, CallKind);

/// Wraps original calls of one service and records their statistics
pub struct MethodInterceptor<C> {
    service: String,
    tracker: Arc<CallContextTracker>,
    recorder: Recorder,
    handlers: HashMap<&'static str, Handler<C>>,
    ignored_methods: HashSet<String>,
    active: Mutex<HashMap<ThreadId, usize>>,
}

impl<C: InterceptedCall> MethodInterceptor<C> {
    pub fn new(
        service: impl Into<String>,
        tracker: Arc<CallContextTracker>,
        recorder: Recorder,
    ) -> Self {
        Self {
            service: service.into(),
            tracker,
            recorder,
            handlers: HashMap::new(),
            ignored_methods: HashSet::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_handler(mut self, method: &'static str, handler: Handler<C>) -> Self {
        self.handlers.insert(method, handler);
        self
    }

    pub fn with_handlers<I>(mut self, handlers: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, Handler<C>)>,
    {
        self.handlers.extend(handlers);
        self
    }

    /// Methods that never get a generic call tally
    pub fn with_ignored_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_methods
            .extend(methods.into_iter().map(Into::into));
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn tracker(&self) -> &Arc<CallContextTracker> {
        &self.tracker
    }

    /// Classify a call about to start on this thread
    pub fn classify(&self) -> CallKind {
        CallKind {
            inside_call: self.tracker.is_active(),
            rewrapped: self
                .lock_active()
                .get(&thread::current().id())
                .is_some_and(|depth| *depth > 0),
        }
    }

    /// Run `original` under interception
    pub fn intercept<T, E>(&self, call: &C, original: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let kind = self.classify();
        let result = {
            let _scope = self.tracker.enter(call.method());
            let _token = self.enter();
            original()
        };

        match &result {
            Ok(_) => self.record(call, kind),
            Err(_) => tracing::debug!(
                service = %self.service,
                method = call.method(),
                "intercepted call failed, nothing recorded"
            ),
        }
        result
    }

    fn record(&self, call: &C, kind: CallKind) {
        let method = call.method();
        if kind.is_top_level() && !self.ignored_methods.contains(method) {
            self.recorder.count_method(&self.service, method);
        }
        if let Some(handler) = self.handlers.get(method) {
            handler(&self.recorder, &self.service, call, kind);
        }
    }

    fn enter(&self) -> ReentryToken<'_> {
        let thread = thread::current().id();
        *self.lock_active().entry(thread).or_insert(0) += 1;
        ReentryToken {
            active: &self.active,
            thread,
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<ThreadId, usize>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C> fmt::Debug for MethodInterceptor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<&str> = self.handlers.keys().copied().collect();
        handlers.sort_unstable();
        f.debug_struct("MethodInterceptor")
            .field("service", &self.service)
            .field("handlers", &handlers)
            .field("ignored_methods", &self.ignored_methods)
            .finish_non_exhaustive()
    }
}

/// Marks an interceptor as active on one thread
struct ReentryToken<'a> {
    active: &'a Mutex<HashMap<ThreadId, usize>>,
    thread: ThreadId,
}

impl Drop for ReentryToken<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(depth) = active.get_mut(&self.thread) {
            *depth -= 1;
            if *depth == 0 {
                active.remove(&self.thread);
            }
        }
    }
}
