//! Collection endpoint and platform collaborators
//!
//! The agent never talks to the network directly: events go through a
//! [`Transport`], and the host environment is described by a
//! [`PlatformMetadata`] detector.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Kinds of events sent to the collection endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunCreated,
    Tags,
    Hyperparams,
    Milestone,
    Stage,
    Dataset,
    Stats,
    ProcData,
    Model,
    ModelVersion,
    Console,
    State,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::RunCreated => "run_created",
            EventKind::Tags => "tags",
            EventKind::Hyperparams => "hyperparams",
            EventKind::Milestone => "milestone",
            EventKind::Stage => "stage",
            EventKind::Dataset => "dataset",
            EventKind::Stats => "stats",
            EventKind::ProcData => "proc_data",
            EventKind::Model => "model",
            EventKind::ModelVersion => "model_version",
            EventKind::Console => "console",
            EventKind::State => "state",
        };
        f.write_str(name)
    }
}

/// Endpoint acknowledgement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Identifier assigned by the endpoint, if any
    pub id: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("endpoint rejected {event} event with status {status}")]
    Rejected { event: EventKind, status: u16 },

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("transport is closed")]
    Closed,
}

pub trait Transport: Send + Sync {
    fn send(&self, event: EventKind, payload: Value) -> Result<Ack, TransportError>;
}

/// Description of the machine the run executes on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMeta {
    pub platform_type: String,
    pub instance_id: Option<String>,
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl PlatformMeta {
    pub fn local() -> Self {
        Self {
            platform_type: "unknown".to_string(),
            instance_id: None,
            region: None,
            extra: BTreeMap::new(),
        }
    }
}

pub trait PlatformMetadata: Send + Sync {
    fn platform_meta(&self) -> PlatformMeta;
}

/// Detector for hosts with no cloud metadata service
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalPlatform;

impl PlatformMetadata for LocalPlatform {
    fn platform_meta(&self) -> PlatformMeta {
        PlatformMeta::local()
    }
}

/// In-memory transport that keeps every event it receives
///
/// Ids are handed out as `run-1`, `run-2`, ... for `RunCreated` events and
/// as `model-1`, `model-2`, ... for `Model` events.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    events: Mutex<Vec<(EventKind, Value)>>,
    failing: AtomicBool,
    next_run: AtomicU64,
    next_model: AtomicU64,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<(EventKind, Value)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Payloads of one event kind, in send order
    pub fn payloads(&self, kind: EventKind) -> Vec<Value> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(event, _)| *event == kind)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, event: EventKind, payload: Value) -> Result<Ack, TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("recording transport set to fail".to_string()));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event, payload));

        let id = match event {
            EventKind::RunCreated => {
                Some(format!("run-{}", self.next_run.fetch_add(1, Ordering::SeqCst) + 1))
            }
            EventKind::Model => {
                Some(format!("model-{}", self.next_model.fetch_add(1, Ordering::SeqCst) + 1))
            }
            _ => None,
        };
        Ok(Ack { id })
    }
}
