//! Experiment run session
//!
//! A [`Run`] is created on the collection endpoint when started, sends
//! metadata events on request and reports a heartbeat in the background.
//! Every heartbeat carries the platform description, a hardware sample, the
//! loaded framework imports and, when anything was recorded since the
//! previous one, the drained instrumentation snapshot.
//!
//! Ending a run flushes one last heartbeat, uploads the captured console
//! output and then reports the final state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use thiserror::Error;

use crate::collector::Collector;
use crate::config::ArceeConfig;
use crate::console::ConsoleCapture;
use crate::environment::{self, GitInfo};
use crate::heartbeat::Heartbeat;
use crate::proc::ProcCollector;
use crate::transport::{Ack, EventKind, PlatformMetadata, Transport, TransportError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to send {event} event: {source}")]
    Transport {
        event: EventKind,
        #[source]
        source: TransportError,
    },

    #[error("run '{0}' is already finished")]
    Finished(String),

    #[error("endpoint did not assign a run id")]
    MissingRunId,

    #[error("endpoint did not assign a model id")]
    MissingModelId,

    #[error("no model registered on run '{0}'")]
    NoModel(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Final run states as reported to the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running = 1,
    Completed = 2,
    Failed = 3,
}

struct RunShared {
    id: String,
    name: String,
    project: String,
    transport: Arc<dyn Transport>,
    platform: Arc<dyn PlatformMetadata>,
    collector: Arc<Collector>,
    proc: ProcCollector,
    finished: AtomicBool,
}

impl RunShared {
    fn send(&self, event: EventKind, payload: Value) -> Result<Ack> {
        if self.finished.load(Ordering::Acquire) {
            return Err(SessionError::Finished(self.id.clone()));
        }
        self.send_unchecked(event, payload)
    }

    fn send_unchecked(&self, event: EventKind, payload: Value) -> Result<Ack> {
        self.transport
            .send(event, payload)
            .map_err(|source| SessionError::Transport { event, source })
    }

    /// Send platform data, hardware stats and whatever the collector holds
    fn report(&self) {
        let collected = self.proc.collect();
        let mut payload = json!({
            "run": self.id,
            "platform": self.platform.platform_meta(),
            "proc_stats": collected.proc_stats,
            "imports": collected.imports,
        });
        let snapshot = self.collector.get();
        if !snapshot.is_empty() {
            payload["instrumentation"] = snapshot.to_json();
        }
        if let Err(err) = self.send_unchecked(EventKind::ProcData, payload) {
            tracing::warn!(run = %self.id, %err, "heartbeat report failed");
        }
    }
}

/// Model currently versioned by the run
struct ModelState {
    id: String,
    version_tags: BTreeMap<String, String>,
}

/// A tracked experiment run
pub struct Run {
    shared: Arc<RunShared>,
    heartbeat: Mutex<Option<Heartbeat>>,
    tags: Mutex<BTreeMap<String, String>>,
    hyperparams: Mutex<BTreeMap<String, Value>>,
    dataset: Mutex<Option<String>>,
    model: Mutex<Option<ModelState>>,
    console: ConsoleCapture,
}

impl Run {
    /// Create the run on the endpoint and start its heartbeat
    ///
    /// The creation event also describes where the run comes from: loaded
    /// framework imports, the git checkout of the executable and the
    /// command line.
    pub fn start(
        config: &ArceeConfig,
        project: &str,
        run_name: Option<&str>,
        transport: Arc<dyn Transport>,
        platform: Arc<dyn PlatformMetadata>,
        collector: Arc<Collector>,
    ) -> Result<Run> {
        let name = run_name.map_or_else(generated_name, str::to_string);
        let proc = ProcCollector::with_root(config.proc_root.clone());
        let git = environment::executable_dir().and_then(|dir| GitInfo::collect(&dir));
        let ack = transport
            .send(
                EventKind::RunCreated,
                json!({
                    "project": project,
                    "name": name,
                    "imports": proc.imports(),
                    "git": git,
                    "command": environment::command_line(),
                }),
            )
            .map_err(|source| SessionError::Transport {
                event: EventKind::RunCreated,
                source,
            })?;
        let id = ack.id.ok_or(SessionError::MissingRunId)?;

        let shared = Arc::new(RunShared {
            id,
            name,
            project: project.to_string(),
            transport,
            platform,
            collector,
            proc,
            finished: AtomicBool::new(false),
        });
        shared.send(
            EventKind::Stats,
            json!({"project": shared.project, "run": shared.id, "data": {}}),
        )?;

        let beat = Arc::clone(&shared);
        let heartbeat = Heartbeat::spawn(config.heartbeat_period(), move || {
            if !beat.finished.load(Ordering::Acquire) {
                beat.report();
            }
        });
        tracing::info!(run = %shared.id, name = %shared.name, project, "run started");

        Ok(Run {
            shared,
            heartbeat: Mutex::new(Some(heartbeat)),
            tags: Mutex::new(BTreeMap::new()),
            hyperparams: Mutex::new(BTreeMap::new()),
            dataset: Mutex::new(None),
            model: Mutex::new(None),
            console: ConsoleCapture::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn project(&self) -> &str {
        &self.shared.project
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Console capture uploaded when the run ends
    pub fn console(&self) -> &ConsoleCapture {
        &self.console
    }

    /// Set a tag; the full tag set is sent
    pub fn tag(&self, key: &str, value: &str) -> Result<()> {
        let tags = {
            let mut tags = lock(&self.tags);
            tags.insert(key.to_string(), value.to_string());
            tags.clone()
        };
        self.shared
            .send(EventKind::Tags, json!({"run": self.id(), "tags": tags}))?;
        Ok(())
    }

    /// Set a hyperparameter; the full set is sent
    pub fn hyperparam(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let hyperparams = {
            let mut hyperparams = lock(&self.hyperparams);
            hyperparams.insert(key.to_string(), value.into());
            hyperparams.clone()
        };
        self.shared.send(
            EventKind::Hyperparams,
            json!({"run": self.id(), "hyperparameters": hyperparams}),
        )?;
        Ok(())
    }

    pub fn milestone(&self, name: &str) -> Result<()> {
        self.shared
            .send(EventKind::Milestone, json!({"run": self.id(), "milestone": name}))?;
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Result<()> {
        self.shared
            .send(EventKind::Stage, json!({"run": self.id(), "stage": name}))?;
        Ok(())
    }

    /// Register the run's dataset; only the first call is sent
    ///
    /// Returns whether this call registered the dataset.
    pub fn dataset(&self, path: &str) -> Result<bool> {
        {
            let mut dataset = lock(&self.dataset);
            if dataset.is_some() {
                return Ok(false);
            }
            *dataset = Some(path.to_string());
        }
        self.shared.send(
            EventKind::Dataset,
            json!({
                "run": self.id(),
                "name": self.name(),
                "project": self.project(),
                "path": path,
            }),
        )?;
        Ok(true)
    }

    /// Register a model and create a version of it for this run
    ///
    /// Later version calls apply to this model. Returns the model id.
    pub fn model(&self, key: &str, path: Option<&str>) -> Result<String> {
        let ack = self.shared.send(EventKind::Model, json!({"key": key}))?;
        let model_id = ack.id.ok_or(SessionError::MissingModelId)?;

        let mut payload = json!({"run": self.id(), "model": model_id});
        if let Some(path) = path {
            payload["path"] = json!(path);
        }
        self.shared.send(EventKind::ModelVersion, payload)?;

        *lock(&self.model) = Some(ModelState {
            id: model_id.clone(),
            version_tags: BTreeMap::new(),
        });
        tracing::debug!(run = %self.shared.id, model = %model_id, key, "model registered");
        Ok(model_id)
    }

    pub fn model_version(&self, version: &str) -> Result<()> {
        self.update_version("version", json!(version))
    }

    /// Replace the aliases of the current model version
    pub fn model_version_aliases(&self, aliases: &[&str]) -> Result<()> {
        self.update_version("aliases", json!(aliases))
    }

    /// Set a tag on the current model version; the full tag set is sent
    pub fn model_version_tag(&self, key: &str, value: &str) -> Result<()> {
        let tags = {
            let mut model = lock(&self.model);
            let model = model
                .as_mut()
                .ok_or_else(|| SessionError::NoModel(self.shared.id.clone()))?;
            model.version_tags.insert(key.to_string(), value.to_string());
            model.version_tags.clone()
        };
        self.update_version("tags", json!(tags))
    }

    fn update_version(&self, field: &str, value: Value) -> Result<()> {
        let model_id = lock(&self.model)
            .as_ref()
            .map(|model| model.id.clone())
            .ok_or_else(|| SessionError::NoModel(self.shared.id.clone()))?;

        let mut payload = json!({"run": self.id(), "model": model_id});
        payload[field] = value;
        self.shared.send(EventKind::ModelVersion, payload)?;
        Ok(())
    }

    /// Send free-form run statistics
    pub fn send(&self, data: Value) -> Result<()> {
        self.shared.send(
            EventKind::Stats,
            json!({"project": self.project(), "run": self.id(), "data": data}),
        )?;
        Ok(())
    }

    /// Mark the run completed
    pub fn finish(&self) -> Result<()> {
        self.end(RunState::Completed)
    }

    /// Mark the run failed
    pub fn fail(&self) -> Result<()> {
        self.end(RunState::Failed)
    }

    fn end(&self, state: RunState) -> Result<()> {
        if self.shared.finished.swap(true, Ordering::AcqRel) {
            return Err(SessionError::Finished(self.shared.id.clone()));
        }

        if let Some(heartbeat) = lock(&self.heartbeat).take() {
            heartbeat.stop();
        }
        self.shared.report();

        let console = self.console.snapshot();
        if let Err(err) = self.shared.send_unchecked(
            EventKind::Console,
            json!({"run": self.id(), "output": console.output, "error": console.error}),
        ) {
            tracing::warn!(run = %self.shared.id, %err, "console upload failed");
        }

        let result = self.shared.send_unchecked(
            EventKind::State,
            json!({"run": self.id(), "state": state as u8, "finish": true}),
        );
        tracing::info!(run = %self.shared.id, state = ?state, "run ended");
        result.map(|_| ())
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("project", &self.shared.project)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn generated_name() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    format!("run_{}", secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalPlatform, RecordingTransport};

    fn config() -> ArceeConfig {
        ArceeConfig {
            heartbeat_period_secs: 3600,
            ..ArceeConfig::default()
        }
    }

    fn start(transport: &Arc<RecordingTransport>) -> Run {
        Run::start(
            &config(),
            "churn-model",
            Some("baseline"),
            Arc::clone(transport) as Arc<dyn Transport>,
            Arc::new(LocalPlatform),
            Arc::new(Collector::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_start_creates_run() {
        let transport = Arc::new(RecordingTransport::new());
        let run = start(&transport);

        assert_eq!(run.id(), "run-1");
        assert_eq!(run.name(), "baseline");
        let created = &transport.payloads(EventKind::RunCreated)[0];
        assert_eq!(created["project"], json!("churn-model"));
        assert_eq!(created["name"], json!("baseline"));
        assert_eq!(created["command"], json!(environment::command_line()));
        assert!(created["imports"].is_array());
        assert!(created.get("git").is_some());
        run.finish().unwrap();
    }

    #[test]
    fn test_start_fails_without_endpoint() {
        let transport = Arc::new(RecordingTransport::new());
        transport.set_failing(true);
        let result = Run::start(
            &config(),
            "p",
            None,
            transport,
            Arc::new(LocalPlatform),
            Arc::new(Collector::new()),
        );
        assert!(matches!(
            result,
            Err(SessionError::Transport {
                event: EventKind::RunCreated,
                ..
            })
        ));
    }

    #[test]
    fn test_tags_accumulate() {
        let transport = Arc::new(RecordingTransport::new());
        let run = start(&transport);
        run.tag("team", "ml").unwrap();
        run.tag("env", "dev").unwrap();

        let tags = transport.payloads(EventKind::Tags);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[1]["tags"], json!({"env": "dev", "team": "ml"}));
        run.finish().unwrap();
    }

    #[test]
    fn test_dataset_registered_once() {
        let transport = Arc::new(RecordingTransport::new());
        let run = start(&transport);

        assert!(run.dataset("s3://data/train.csv").unwrap());
        assert!(!run.dataset("s3://data/other.csv").unwrap());
        assert_eq!(transport.payloads(EventKind::Dataset).len(), 1);
        run.finish().unwrap();
    }

    #[test]
    fn test_finish_reports_state_and_blocks_sends() {
        let transport = Arc::new(RecordingTransport::new());
        let run = start(&transport);
        run.finish().unwrap();

        assert!(run.is_finished());
        assert_eq!(
            transport.payloads(EventKind::State),
            vec![json!({"run": "run-1", "state": 2, "finish": true})]
        );
        assert!(matches!(run.milestone("late"), Err(SessionError::Finished(_))));
        assert!(matches!(run.finish(), Err(SessionError::Finished(_))));
    }

    #[test]
    fn test_model_versioning() {
        let transport = Arc::new(RecordingTransport::new());
        let run = start(&transport);

        let model = run.model("churn", Some("s3://models/churn.bin")).unwrap();
        assert_eq!(model, "model-1");
        run.model_version("1.2.0").unwrap();
        run.model_version_aliases(&["latest", "prod"]).unwrap();
        run.model_version_tag("framework", "xgboost").unwrap();
        run.model_version_tag("owner", "ml").unwrap();

        assert_eq!(transport.payloads(EventKind::Model), vec![json!({"key": "churn"})]);
        assert_eq!(
            transport.payloads(EventKind::ModelVersion),
            vec![
                json!({"run": "run-1", "model": "model-1", "path": "s3://models/churn.bin"}),
                json!({"run": "run-1", "model": "model-1", "version": "1.2.0"}),
                json!({"run": "run-1", "model": "model-1", "aliases": ["latest", "prod"]}),
                json!({"run": "run-1", "model": "model-1", "tags": {"framework": "xgboost"}}),
                json!({
                    "run": "run-1",
                    "model": "model-1",
                    "tags": {"framework": "xgboost", "owner": "ml"}
                }),
            ]
        );
        run.finish().unwrap();
    }

    #[test]
    fn test_model_without_path() {
        let transport = Arc::new(RecordingTransport::new());
        let run = start(&transport);
        run.model("churn", None).unwrap();

        assert_eq!(
            transport.payloads(EventKind::ModelVersion),
            vec![json!({"run": "run-1", "model": "model-1"})]
        );
        run.finish().unwrap();
    }

    #[test]
    fn test_version_calls_need_a_model() {
        let transport = Arc::new(RecordingTransport::new());
        let run = start(&transport);

        assert!(matches!(run.model_version("1"), Err(SessionError::NoModel(_))));
        assert!(matches!(run.model_version_aliases(&["a"]), Err(SessionError::NoModel(_))));
        assert!(matches!(run.model_version_tag("k", "v"), Err(SessionError::NoModel(_))));
        assert!(transport.payloads(EventKind::ModelVersion).is_empty());
        run.finish().unwrap();
    }

    #[test]
    fn test_console_sent_before_state() {
        let transport = Arc::new(RecordingTransport::new());
        let run = start(&transport);
        {
            use std::io::Write;
            let mut out = run.console().tee(crate::console::Stream::Output, std::io::sink());
            writeln!(out, "epoch 1").unwrap();
        }
        run.finish().unwrap();

        let kinds: Vec<EventKind> = transport.events().into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(&kinds[kinds.len() - 2..], &[EventKind::Console, EventKind::State]);
        assert_eq!(
            transport.payloads(EventKind::Console),
            vec![json!({"run": "run-1", "output": "epoch 1\n", "error": ""})]
        );
    }

    #[test]
    fn test_fail_reports_failed_state() {
        let transport = Arc::new(RecordingTransport::new());
        let run = start(&transport);
        run.fail().unwrap();
        assert_eq!(transport.payloads(EventKind::State)[0]["state"], json!(3));
    }
}
