//! Instrumentation of host clients
//!
//! Host code builds a handle per client (for example [`s3::S3Handle`]) and
//! registers its [`PatchTarget`] here. [`Instrumentation::instrument`] then
//! wraps every registered target of every enabled package:
//!
//! - `s3`: object storage client, transfer manager and its worker pool
//! - `ec2`: generic service API, method tallies only
//! - `redshift`: SQL sessions, query history collected on close
//!
//! Instrumenting is idempotent and can be undone with
//! [`Instrumentation::revert`].

pub mod ec2;
pub mod redshift;
pub mod s3;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::collector::Collector;
use crate::config::InstrumentationConfig;
use crate::context::CallContextTracker;
use crate::patch::{PatchRegistry, PatchTarget};
use crate::stats::{Recorder, StatRegistry};

/// What one `instrument()` pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentReport {
    /// Installed patches per component
    pub installed: BTreeMap<String, usize>,
    /// Patches skipped because the target lacked the attribute
    pub skipped: Vec<String>,
}

impl InstrumentReport {
    pub fn installed(&self, component: &str) -> usize {
        self.installed.get(component).copied().unwrap_or(0)
    }
}

/// Shared instrumentation services
pub struct Instrumentation {
    registry: Arc<StatRegistry>,
    tracker: Arc<CallContextTracker>,
    patches: PatchRegistry,
    collector: Arc<Collector>,
    config: InstrumentationConfig,
    targets: Mutex<Vec<Arc<PatchTarget>>>,
}

impl Instrumentation {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self::with_config(collector, InstrumentationConfig::default())
    }

    pub fn with_config(collector: Arc<Collector>, config: InstrumentationConfig) -> Self {
        Self {
            registry: Arc::new(StatRegistry::new()),
            tracker: Arc::new(CallContextTracker::new()),
            patches: PatchRegistry::new(),
            collector,
            config,
            targets: Mutex::new(Vec::new()),
        }
    }

    /// Make a host client available for instrumentation
    pub fn register(&self, target: Arc<PatchTarget>) {
        let mut targets = self.lock_targets();
        if targets.iter().any(|known| Arc::ptr_eq(known, &target)) {
            return;
        }
        tracing::debug!(
            package = target.package(),
            service = target.service(),
            target = target.name(),
            "registered instrumentation target"
        );
        targets.push(target);
    }

    /// Patch every registered target of every enabled package
    pub fn instrument(&self) -> InstrumentReport {
        let mut report = InstrumentReport::default();
        if self.config.s3 {
            s3::instrument(self, &mut report);
        }
        if self.config.ec2 {
            ec2::instrument(self, &mut report);
        }
        if self.config.redshift {
            redshift::instrument(self, &mut report);
        }
        tracing::debug!(installed = ?report.installed, "instrumentation applied");
        report
    }

    /// Undo every patch and stop counting
    pub fn revert(&self) -> usize {
        let reverted = self.patches.revert_all();
        for service in self.registry.services() {
            self.registry.unregister(&service);
        }
        reverted
    }

    pub fn recorder(&self) -> Recorder {
        Recorder::new(Arc::clone(&self.registry), Arc::clone(&self.collector))
    }

    pub fn tracker(&self) -> &Arc<CallContextTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<StatRegistry> {
        &self.registry
    }

    pub fn patches(&self) -> &PatchRegistry {
        &self.patches
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    /// Registered targets belonging to a service
    pub(crate) fn targets_for(&self, service: &str) -> Vec<Arc<PatchTarget>> {
        self.lock_targets()
            .iter()
            .filter(|target| target.service() == service)
            .cloned()
            .collect()
    }

    /// Install one patch, logging and skipping targets without the attribute
    pub(crate) fn install<T, F>(
        &self,
        report: &mut InstrumentReport,
        component: &str,
        target: &PatchTarget,
        attribute: &str,
        wrap: F,
    ) where
        T: ?Sized + Send + Sync + 'static,
        F: FnOnce(Arc<T>) -> Arc<T>,
    {
        match self.patches.install(component, target, attribute, wrap) {
            Ok(()) => *report.installed.entry(component.to_string()).or_default() += 1,
            Err(err) => {
                tracing::warn!(component, %err, "skipping patch");
                report
                    .skipped
                    .push(format!("{}.{}", target.name(), attribute));
            }
        }
    }

    fn lock_targets(&self) -> MutexGuard<'_, Vec<Arc<PatchTarget>>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("config", &self.config)
            .field("services", &self.registry.services())
            .field("patches", &self.patches)
            .finish_non_exhaustive()
    }
}
