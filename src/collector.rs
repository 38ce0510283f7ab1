//! Process-wide statistics collector
//!
//! Interceptors on any thread push [`Stats`] into a lock-free queue. The
//! reporting side drains it and folds everything into a [`Snapshot`].
//!
//! ```text
//! caller threads                         reporting thread
//!   intercept() ─┐
//!   intercept() ─┼─► SegQueue<Stats> ──► get(): pop, fold, group ──► Snapshot
//!   read()      ─┘    (lock-free)         (one drain at a time)
//! ```
//!
//! Draining is destructive: every accumulator is reported exactly once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crossbeam::queue::SegQueue;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::stats::Stats;

/// Key used for package-level statistics (no service)
pub const PACKAGE_LEVEL_KEY: &str = "_";

/// Lock-free multi-producer stats queue with a serialized drain
#[derive(Debug, Default)]
pub struct Collector {
    queue: SegQueue<Stats>,

    /// Only one drain folds at a time
    drain_lock: Mutex<()>,

    /// Metrics: total accumulators added
    total_added: AtomicU64,

    /// Metrics: accumulators dropped because they failed to merge
    total_dropped: AtomicU64,
}

/// Collector counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStats {
    pub total_added: u64,
    pub total_dropped: u64,
    pub pending: usize,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a partial measurement (never blocks)
    pub fn add(&self, stats: Stats) {
        self.queue.push(stats);
        self.total_added.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of accumulators waiting for the next drain
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drain the queue and fold it into one snapshot
    ///
    /// Only the accumulators present when the drain starts are taken; items
    /// added concurrently are left for the next call. Accumulators that fail
    /// to merge are logged and dropped.
    pub fn get(&self) -> Snapshot {
        let _guard = self.drain_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let pending = self.queue.len();
        let mut folded: BTreeMap<(&'static str, Option<&'static str>), Stats> = BTreeMap::new();

        for _ in 0..pending {
            let Some(stats) = self.queue.pop() else {
                break;
            };
            let key = (stats.package(), stats.service());
            match folded.get_mut(&key) {
                Some(acc) => {
                    if let Err(err) = acc.merge(stats) {
                        self.total_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(%err, "dropping stats that failed to merge");
                    }
                }
                None => {
                    folded.insert(key, stats);
                }
            }
        }

        let mut snapshot = Snapshot::default();
        for ((package, service), stats) in folded {
            let service = service.unwrap_or(PACKAGE_LEVEL_KEY);
            snapshot
                .packages
                .entry(package.to_string())
                .or_default()
                .insert(service.to_string(), stats.to_snapshot());
        }
        snapshot
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            total_added: self.total_added.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            pending: self.queue.len(),
        }
    }
}

/// Merged statistics grouped by package, then service
///
/// Serializes as `{package: {service | "_": {field: value}}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    packages: BTreeMap<String, BTreeMap<String, Map<String, Value>>>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Fields recorded for a package/service (`None` for package-level)
    pub fn get(&self, package: &str, service: Option<&str>) -> Option<&Map<String, Value>> {
        self.packages
            .get(package)?
            .get(service.unwrap_or(PACKAGE_LEVEL_KEY))
    }

    /// Single field value
    pub fn field(&self, package: &str, service: Option<&str>, field: &str) -> Option<&Value> {
        self.get(package, service)?.get(field)
    }

    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.packages
                .iter()
                .map(|(package, services)| {
                    let services = services
                        .iter()
                        .map(|(service, fields)| (service.clone(), Value::Object(fields.clone())))
                        .collect();
                    (package.clone(), Value::Object(services))
                })
                .collect(),
        )
    }
}

impl From<Snapshot> for Value {
    fn from(snapshot: Snapshot) -> Self {
        snapshot.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{FieldDef, FieldKind, FieldValue, StatSchema, BYTES_UPLOADED, QUERIES};
    use serde_json::json;

    static UPLOADS: StatSchema = StatSchema {
        package: "cloud",
        service: Some("store"),
        fields: &[FieldDef::new(BYTES_UPLOADED, FieldKind::Counter)],
    };

    static DOWNLOADS: StatSchema = StatSchema {
        package: "cloud",
        service: Some("store"),
        fields: &[FieldDef::new("bytes_read", FieldKind::Counter)],
    };

    static HISTORY: StatSchema = StatSchema {
        package: "warehouse",
        service: None,
        fields: &[FieldDef::new(QUERIES, FieldKind::Records)],
    };

    fn uploaded(bytes: u64) -> Stats {
        Stats::empty(&UPLOADS)
            .with(BYTES_UPLOADED, FieldValue::Counter(bytes))
            .unwrap()
    }

    #[test]
    fn test_empty_collector_gives_empty_snapshot() {
        let collector = Collector::new();
        let snapshot = collector.get();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.to_json(), json!({}));
    }

    #[test]
    fn test_get_folds_same_service() {
        let collector = Collector::new();
        collector.add(uploaded(1));
        collector.add(uploaded(2));
        collector.add(uploaded(3));

        let snapshot = collector.get();
        assert_eq!(
            snapshot.field("cloud", Some("store"), BYTES_UPLOADED),
            Some(&json!(6))
        );
    }

    #[test]
    fn test_get_is_destructive() {
        let collector = Collector::new();
        collector.add(uploaded(10));

        assert!(!collector.get().is_empty());
        assert!(collector.get().is_empty());

        collector.add(uploaded(5));
        assert_eq!(
            collector.get().field("cloud", Some("store"), BYTES_UPLOADED),
            Some(&json!(5))
        );
    }

    #[test]
    fn test_package_level_stats_use_placeholder_key() {
        let collector = Collector::new();
        collector.add(
            Stats::empty(&HISTORY)
                .with(QUERIES, FieldValue::Records(vec![json!({"query": "select 1"})]))
                .unwrap(),
        );

        let snapshot = collector.get();
        assert_eq!(
            snapshot.to_json(),
            json!({"warehouse": {"_": {"queries": [{"query": "select 1"}]}}})
        );
        assert!(snapshot.get("warehouse", None).is_some());
    }

    #[test]
    fn test_unmergeable_entry_is_dropped() {
        let collector = Collector::new();
        collector.add(uploaded(4));
        collector.add(
            Stats::empty(&DOWNLOADS)
                .with("bytes_read", FieldValue::Counter(9))
                .unwrap(),
        );

        let snapshot = collector.get();
        assert_eq!(
            snapshot.field("cloud", Some("store"), BYTES_UPLOADED),
            Some(&json!(4))
        );

        let stats = collector.stats();
        assert_eq!(stats.total_added, 2);
        assert_eq!(stats.total_dropped, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_snapshot_serializes_like_to_json() {
        let collector = Collector::new();
        collector.add(uploaded(8));
        let snapshot = collector.get();

        let serialized = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(serialized, snapshot.to_json());
    }
}
