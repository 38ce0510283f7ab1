//! Statistics recording helpers used by interception handlers

use std::sync::Arc;

use serde_json::Value;

use super::{
    FieldValue, StatRegistry, Stats, BYTES_DOWNLOADED, BYTES_UPLOADED, FILES_ACCESSED,
    METHOD_CALLS, QUERIES,
};
use crate::collector::Collector;

/// Builds single-field accumulators and pushes them to the collector
///
/// Every operation is a no-op for services missing from the registry.
/// Recording never fails from the caller's point of view: invalid updates
/// are logged and dropped.
#[derive(Debug, Clone)]
pub struct Recorder {
    registry: Arc<StatRegistry>,
    collector: Arc<Collector>,
}

impl Recorder {
    pub fn new(registry: Arc<StatRegistry>, collector: Arc<Collector>) -> Self {
        Self {
            registry,
            collector,
        }
    }

    pub fn count_uploaded_bytes(&self, service: &str, bytes: u64) {
        self.record(service, BYTES_UPLOADED, FieldValue::Counter(bytes));
    }

    pub fn count_downloaded_bytes(&self, service: &str, bytes: u64) {
        self.record(service, BYTES_DOWNLOADED, FieldValue::Counter(bytes));
    }

    pub fn count_method(&self, service: &str, method: &str) {
        self.record(service, METHOD_CALLS, FieldValue::tally(method, 1));
    }

    pub fn count_file(&self, service: &str, bucket: &str, key: &str) {
        self.record(service, FILES_ACCESSED, FieldValue::files(bucket, [key]));
    }

    pub fn count_files<I, S>(&self, service: &str, bucket: &str, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.record(service, FILES_ACCESSED, FieldValue::files(bucket, keys));
    }

    pub fn count_queries(&self, component: &str, records: Vec<Value>) {
        if records.is_empty() {
            return;
        }
        self.record(component, QUERIES, FieldValue::Records(records));
    }

    /// Push a single-field update for a registered service
    pub fn record(&self, service: &str, field: &str, value: FieldValue) {
        let Some(schema) = self.registry.schema(service) else {
            tracing::trace!(service, field, "service not registered, skipping");
            return;
        };
        match Stats::empty(schema).with(field, value) {
            Ok(stats) => self.collector.add(stats),
            Err(err) => tracing::debug!(service, %err, "dropping invalid stats update"),
        }
    }

    pub fn registry(&self) -> &Arc<StatRegistry> {
        &self.registry
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }
}
