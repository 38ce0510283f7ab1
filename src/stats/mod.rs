//! Mergeable usage statistics
//!
//! A [`Stats`] value is a partial measurement for one (package, service)
//! pair: bytes moved, method call tallies, files touched, query history.
//! Interceptors build them with a single field set and push them to the
//! [`Collector`](crate::collector::Collector), which folds everything
//! together with [`Stats::merge`] when a report is drained.
//!
//! Every accumulator follows a fixed [`StatSchema`]. Two accumulators only
//! combine when their schemas are identical; merging is commutative and
//! associative, and [`Stats::empty`] is the identity.

pub mod recorder;
pub mod registry;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

pub use recorder::Recorder;
pub use registry::StatRegistry;

/// Generic per-method call tally
pub const METHOD_CALLS: &str = "method_calls";
/// Bytes sent to the remote service
pub const BYTES_UPLOADED: &str = "bytes_uploaded";
/// Bytes received from the remote service
pub const BYTES_DOWNLOADED: &str = "bytes_downloaded";
/// Files touched, grouped by bucket/container
pub const FILES_ACCESSED: &str = "files_accessed";
/// Query history records
pub const QUERIES: &str = "queries";

/// Errors raised by the merge algebra
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    #[error("unsupported combination of {left} stats and {right} stats")]
    SchemaMismatch { left: String, right: String },

    #[error("field '{field}' is not part of the {schema} schema")]
    UnknownField { schema: String, field: String },

    #[error("field '{field}' holds {expected} values, got {actual}")]
    FieldKind {
        field: String,
        expected: FieldKind,
        actual: FieldKind,
    },
}

/// Shape of a single schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Integer counter, merged by addition
    Counter,
    /// Name to count mapping, merged key by key with addition
    Tally,
    /// Bucket to set-of-names mapping, merged key by key with set union
    FileSet,
    /// List of JSON records, merged by concatenation
    Records,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Counter => "counter",
            FieldKind::Tally => "tally",
            FieldKind::FileSet => "file set",
            FieldKind::Records => "records",
        };
        f.write_str(name)
    }
}

/// A named field of a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldDef {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// Fixed set of fields recorded for one package/service
///
/// Schemas are declared as statics next to the instrumentation that fills
/// them, e.g. the S3 schema lives in [`crate::instrumentation::s3`].
#[derive(Debug, PartialEq, Eq)]
pub struct StatSchema {
    pub package: &'static str,
    /// `None` for package-level statistics
    pub service: Option<&'static str>,
    pub fields: &'static [FieldDef],
}

impl StatSchema {
    /// Look up a field definition by name
    pub fn field(&self, name: &str) -> Option<&'static FieldDef> {
        self.fields.iter().find(|def| def.name == name)
    }
}

impl fmt::Display for StatSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.service {
            Some(service) => write!(f, "{}/{}", self.package, service),
            None => f.write_str(self.package),
        }
    }
}

/// Value of one populated field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Counter(u64),
    Tally(BTreeMap<String, u64>),
    FileSet(BTreeMap<String, BTreeSet<String>>),
    Records(Vec<Value>),
}

impl FieldValue {
    /// Tally with a single entry
    pub fn tally(name: impl Into<String>, count: u64) -> Self {
        FieldValue::Tally(BTreeMap::from([(name.into(), count)]))
    }

    /// File set with a single bucket
    pub fn files<I, S>(bucket: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names.into_iter().map(Into::into).collect();
        FieldValue::FileSet(BTreeMap::from([(bucket.into(), names)]))
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Counter(_) => FieldKind::Counter,
            FieldValue::Tally(_) => FieldKind::Tally,
            FieldValue::FileSet(_) => FieldKind::FileSet,
            FieldValue::Records(_) => FieldKind::Records,
        }
    }

    /// Fold `other` into `self`; both sides must be the same kind
    fn absorb(&mut self, other: FieldValue) {
        match (self, other) {
            (FieldValue::Counter(left), FieldValue::Counter(right)) => {
                *left = left.saturating_add(right);
            }
            (FieldValue::Tally(left), FieldValue::Tally(right)) => {
                for (name, count) in right {
                    let entry = left.entry(name).or_insert(0);
                    *entry = entry.saturating_add(count);
                }
            }
            (FieldValue::FileSet(left), FieldValue::FileSet(right)) => {
                for (bucket, names) in right {
                    left.entry(bucket).or_default().extend(names);
                }
            }
            (FieldValue::Records(left), FieldValue::Records(right)) => left.extend(right),
            // kinds are checked by Stats::merge before anything is absorbed
            _ => {}
        }
    }

    /// Render as JSON; sets become sorted arrays
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Counter(count) => Value::from(*count),
            FieldValue::Tally(tally) => Value::Object(
                tally
                    .iter()
                    .map(|(name, count)| (name.clone(), Value::from(*count)))
                    .collect(),
            ),
            FieldValue::FileSet(files) => Value::Object(
                files
                    .iter()
                    .map(|(bucket, names)| {
                        let names = names.iter().cloned().map(Value::String).collect();
                        (bucket.clone(), Value::Array(names))
                    })
                    .collect(),
            ),
            FieldValue::Records(records) => Value::Array(records.clone()),
        }
    }
}

/// Partial statistics for one package/service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    schema: &'static StatSchema,
    values: BTreeMap<&'static str, FieldValue>,
}

impl Stats {
    /// Accumulator with every field unset (the merge identity)
    pub fn empty(schema: &'static StatSchema) -> Self {
        Self {
            schema,
            values: BTreeMap::new(),
        }
    }

    /// Set a field, validating it against the schema
    pub fn with(mut self, field: &str, value: FieldValue) -> Result<Self, StatsError> {
        let def = self.schema.field(field).ok_or_else(|| StatsError::UnknownField {
            schema: self.schema.to_string(),
            field: field.to_string(),
        })?;
        if def.kind != value.kind() {
            return Err(StatsError::FieldKind {
                field: field.to_string(),
                expected: def.kind,
                actual: value.kind(),
            });
        }
        self.values.insert(def.name, value);
        Ok(self)
    }

    pub fn schema(&self) -> &'static StatSchema {
        self.schema
    }

    pub fn package(&self) -> &'static str {
        self.schema.package
    }

    pub fn service(&self) -> Option<&'static str> {
        self.schema.service
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    /// Counter field value, if set
    pub fn counter(&self, field: &str) -> Option<u64> {
        match self.values.get(field) {
            Some(FieldValue::Counter(count)) => Some(*count),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fold `other` into `self`
    ///
    /// Fails without modifying `self` when the schemas differ.
    pub fn merge(&mut self, other: Stats) -> Result<(), StatsError> {
        if self.schema != other.schema {
            return Err(StatsError::SchemaMismatch {
                left: self.schema.to_string(),
                right: other.schema.to_string(),
            });
        }
        for (field, value) in &other.values {
            if let Some(existing) = self.values.get(field) {
                if existing.kind() != value.kind() {
                    return Err(StatsError::FieldKind {
                        field: field.to_string(),
                        expected: existing.kind(),
                        actual: value.kind(),
                    });
                }
            }
        }
        for (field, value) in other.values {
            match self.values.get_mut(field) {
                Some(existing) => existing.absorb(value),
                None => {
                    self.values.insert(field, value);
                }
            }
        }
        Ok(())
    }

    /// Combine two accumulators into a new one
    pub fn combine(mut self, other: Stats) -> Result<Stats, StatsError> {
        self.merge(other)?;
        Ok(self)
    }

    /// Populated fields as a JSON object; unset fields are omitted
    pub fn to_snapshot(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|(field, value)| (field.to_string(), value.to_json()))
            .collect()
    }
}
