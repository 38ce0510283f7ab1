//! Integration tests for run sessions and heartbeat reporting

use std::fs;
use std::io::Write;
use std::sync::Arc;

use arcee::collector::Collector;
use arcee::config::{ArceeConfig, TransferConfig};
use arcee::instrumentation::s3::{MemoryS3, S3Handle};
use arcee::instrumentation::Instrumentation;
use arcee::console::Stream;
use arcee::session::{Run, SessionError};
use arcee::transport::{EventKind, LocalPlatform, RecordingTransport, Transport};
use serde_json::{json, Value};
use tempfile::TempDir;

fn config() -> ArceeConfig {
    ArceeConfig {
        heartbeat_period_secs: 3600,
        ..ArceeConfig::default()
    }
}

/// Directory laid out like /proc for a two-CPU host running torch
fn fake_proc() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("self")).unwrap();
    let files = [
        ("stat", "cpu  600 0 200 3000 200 0 0 0\ncpu0 300 0 100 1500 100 0 0 0\ncpu1 300 0 100 1500 100 0 0 0\n"),
        ("meminfo", "MemTotal: 4194304 kB\nMemAvailable: 3145728 kB\nSwapTotal: 0 kB\n"),
        ("loadavg", "0.25 0.50 1.00 2/120 999\n"),
        ("self/stat", "999 (train) R 1 999 999 0 -1 0 0 0 0 0 160 40 0 0 20 0 1 0 5 0 0"),
        ("self/status", "VmSize:\t 1048576 kB\nVmRSS:\t 524288 kB\n"),
        ("self/maps", "7f00-7f01 r-xp 00000000 08:01 77 /venv/lib/torch/lib/libtorch_cuda.so\n"),
    ];
    for (name, content) in files {
        fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

fn start(transport: &Arc<RecordingTransport>, collector: &Arc<Collector>) -> Run {
    Run::start(
        &config(),
        "forecasting",
        Some("lstm-v2"),
        Arc::clone(transport) as Arc<dyn Transport>,
        Arc::new(LocalPlatform),
        Arc::clone(collector),
    )
    .unwrap()
}

fn instrumentation_reports(transport: &RecordingTransport) -> Vec<Value> {
    transport
        .payloads(EventKind::ProcData)
        .into_iter()
        .filter_map(|payload| payload.get("instrumentation").cloned())
        .collect()
}

#[test]
fn test_instrumentation_reported_exactly_once() {
    let transport = Arc::new(RecordingTransport::new());
    let collector = Arc::new(Collector::new());

    let instrumentation = Instrumentation::new(Arc::clone(&collector));
    let store = Arc::new(MemoryS3::new().with_bucket("datasets"));
    let handle = S3Handle::new("default", store, &TransferConfig::default());
    instrumentation.register(handle.target());
    instrumentation.instrument();

    let run = start(&transport, &collector);
    handle
        .client()
        .put_object("datasets", "train.parquet", &[0u8; 256])
        .unwrap();
    run.finish().unwrap();

    assert_eq!(
        instrumentation_reports(&transport),
        vec![json!({
            "aws_sdk": {
                "s3": {
                    "method_calls": {"put_object": 1},
                    "bytes_uploaded": 256,
                    "files_accessed": {"datasets": ["train.parquet"]}
                }
            }
        })]
    );
    assert!(collector.get().is_empty());
}

#[test]
fn test_heartbeat_reports_platform() {
    let transport = Arc::new(RecordingTransport::new());
    let run = start(&transport, &Arc::new(Collector::new()));
    run.finish().unwrap();

    let reports = transport.payloads(EventKind::ProcData);
    assert!(!reports.is_empty());
    for report in &reports {
        assert_eq!(report["run"], json!("run-1"));
        assert_eq!(report["platform"]["platform_type"], json!("unknown"));
        assert!(report.get("proc_stats").is_some());
        assert!(report["imports"].is_array());
        assert!(report.get("instrumentation").is_none());
    }
}

#[test]
fn test_heartbeat_reports_proc_stats_and_imports() {
    let proc_root = fake_proc();
    let transport = Arc::new(RecordingTransport::new());
    let run = Run::start(
        &ArceeConfig {
            proc_root: proc_root.path().to_path_buf(),
            ..config()
        },
        "forecasting",
        Some("lstm-v2"),
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(LocalPlatform),
        Arc::new(Collector::new()),
    )
    .unwrap();
    run.finish().unwrap();

    assert_eq!(
        transport.payloads(EventKind::RunCreated)[0]["imports"],
        json!(["torch"])
    );

    let report = transport.payloads(EventKind::ProcData).pop().unwrap();
    assert_eq!(report["imports"], json!(["torch"]));
    let stats = &report["proc_stats"];
    assert_eq!(stats["ps_stats"]["cpu_count"], json!(2));
    assert_eq!(stats["ps_stats"]["load_average"], json!([0.25, 0.5, 1.0]));
    assert_eq!(stats["ps_stats"]["used_ram_percent"], json!(25.0));
    assert_eq!(stats["ps_stats"]["used_ram_mb"], json!(1024.0));
    assert_eq!(stats["proc"]["mem"]["rss"], json!({"p": "0.125", "t": 536870912u64}));
    assert_eq!(stats["proc"]["mem"]["vms"], json!({"p": "0.250", "t": 1073741824u64}));
}

#[test]
fn test_missing_proc_root_still_reports() {
    let transport = Arc::new(RecordingTransport::new());
    let run = Run::start(
        &ArceeConfig {
            proc_root: "/nonexistent/proc".into(),
            ..config()
        },
        "forecasting",
        None,
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(LocalPlatform),
        Arc::new(Collector::new()),
    )
    .unwrap();
    run.finish().unwrap();

    let report = transport.payloads(EventKind::ProcData).pop().unwrap();
    assert_eq!(report["proc_stats"], Value::Null);
    assert_eq!(report["imports"], json!([]));
}

#[test]
fn test_run_created_describes_origin() {
    let transport = Arc::new(RecordingTransport::new());
    let run = start(&transport, &Arc::new(Collector::new()));
    run.finish().unwrap();

    let created = &transport.payloads(EventKind::RunCreated)[0];
    let command = created["command"].as_str().unwrap();
    let program = std::env::args().next().unwrap();
    assert!(command.starts_with(&program));
    let git = &created["git"];
    assert!(git.is_null() || git["commit_id"].is_string());
}

#[test]
fn test_event_order_for_full_run() {
    let transport = Arc::new(RecordingTransport::new());
    let run = start(&transport, &Arc::new(Collector::new()));

    run.tag("owner", "ml-platform").unwrap();
    run.hyperparam("learning_rate", 0.001).unwrap();
    run.stage("preprocessing").unwrap();
    run.milestone("data loaded").unwrap();
    run.send(json!({"loss": 0.42})).unwrap();
    run.model("forecaster", Some("s3://models/lstm.pt")).unwrap();
    run.model_version("2").unwrap();
    run.finish().unwrap();

    let kinds: Vec<EventKind> = transport
        .events()
        .into_iter()
        .map(|(kind, _)| kind)
        .filter(|kind| *kind != EventKind::ProcData)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::RunCreated,
            EventKind::Stats,
            EventKind::Tags,
            EventKind::Hyperparams,
            EventKind::Stage,
            EventKind::Milestone,
            EventKind::Stats,
            EventKind::Model,
            EventKind::ModelVersion,
            EventKind::ModelVersion,
            EventKind::Console,
            EventKind::State,
        ]
    );
    assert_eq!(
        transport.payloads(EventKind::Stats)[1],
        json!({"project": "forecasting", "run": "run-1", "data": {"loss": 0.42}})
    );
}

#[test]
fn test_console_uploaded_before_final_state() {
    let transport = Arc::new(RecordingTransport::new());
    let run = start(&transport, &Arc::new(Collector::new()));

    writeln!(run.console().tee(Stream::Output, std::io::sink()), "epoch 1 loss=0.42").unwrap();
    writeln!(run.console().tee(Stream::Error, std::io::sink()), "warning: slow io").unwrap();
    run.fail().unwrap();

    let events = transport.events();
    let console = events
        .iter()
        .position(|(kind, _)| *kind == EventKind::Console)
        .unwrap();
    let state = events
        .iter()
        .position(|(kind, _)| *kind == EventKind::State)
        .unwrap();
    let last_report = events
        .iter()
        .rposition(|(kind, _)| *kind == EventKind::ProcData)
        .unwrap();
    assert!(last_report < console && console < state);
    assert_eq!(
        events[console].1,
        json!({
            "run": "run-1",
            "output": "epoch 1 loss=0.42\n",
            "error": "warning: slow io\n"
        })
    );
    assert_eq!(events[state].1["state"], json!(3));
}

#[test]
fn test_model_versions_follow_latest_model() {
    let transport = Arc::new(RecordingTransport::new());
    let run = start(&transport, &Arc::new(Collector::new()));

    run.model("encoder", None).unwrap();
    run.model_version_tag("stage", "pretrain").unwrap();
    run.model("decoder", Some("/models/decoder")).unwrap();
    run.model_version_tag("stage", "finetune").unwrap();
    run.model_version_aliases(&["best"]).unwrap();
    run.finish().unwrap();

    let versions = transport.payloads(EventKind::ModelVersion);
    assert_eq!(versions[1]["model"], json!("model-1"));
    // tags start over for a new model
    assert_eq!(
        versions[3],
        json!({"run": "run-1", "model": "model-2", "tags": {"stage": "finetune"}})
    );
    assert_eq!(
        versions[4],
        json!({"run": "run-1", "model": "model-2", "aliases": ["best"]})
    );
    assert!(matches!(
        run.model_version("3"),
        Err(SessionError::Finished(_))
    ));
}

#[test]
fn test_finish_surfaces_transport_failure() {
    let transport = Arc::new(RecordingTransport::new());
    let run = start(&transport, &Arc::new(Collector::new()));

    transport.set_failing(true);
    let result = run.finish();

    assert!(matches!(
        result,
        Err(SessionError::Transport {
            event: EventKind::State,
            ..
        })
    ));
    assert!(run.is_finished());
}

#[test]
fn test_generated_run_name() {
    let transport = Arc::new(RecordingTransport::new());
    let run = Run::start(
        &config(),
        "forecasting",
        None,
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(LocalPlatform),
        Arc::new(Collector::new()),
    )
    .unwrap();

    assert!(run.name().starts_with("run_"));
    assert_eq!(
        transport.payloads(EventKind::RunCreated)[0]["name"],
        json!(run.name())
    );
    run.finish().unwrap();
}
