use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result};
use arcee::cli::{Cli, UploadMode};
use arcee::collector::Collector;
use arcee::config::ArceeConfig;
use arcee::instrumentation::s3::{MemoryS3, S3Handle};
use arcee::instrumentation::Instrumentation;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<ArceeConfig> {
    let config = match &cli.config {
        Some(path) => ArceeConfig::from_file(path)?,
        None => ArceeConfig::default(),
    };
    config.with_env_overrides()
}

/// Upload, read back and (optionally) delete `cli.objects` objects
fn run_workload(cli: &Cli, handle: &S3Handle) -> Result<()> {
    let body: Vec<u8> = (0..cli.size).map(|i| (i % 251) as u8).collect();
    let keys: Vec<String> = (0..cli.objects)
        .map(|index| format!("demo/object-{index}.bin"))
        .collect();

    for key in &keys {
        match cli.mode {
            UploadMode::Put => {
                handle
                    .client()
                    .put_object(&cli.bucket, key, &body)
                    .with_context(|| format!("Failed to put {}", key))?;
            }
            UploadMode::Transfer => {
                handle
                    .transfer()
                    .upload_fileobj(&mut Cursor::new(&body), &cli.bucket, key)
                    .with_context(|| format!("Failed to upload {}", key))?;
            }
        }

        let mut downloaded = Vec::with_capacity(body.len());
        handle
            .transfer()
            .download_fileobj(&cli.bucket, key, &mut downloaded)
            .with_context(|| format!("Failed to download {}", key))?;
        if downloaded != body {
            anyhow::bail!("Downloaded contents of {} differ from the upload", key);
        }
    }

    if !cli.keep && !keys.is_empty() {
        handle
            .client()
            .delete_objects(&cli.bucket, &keys)
            .context("Failed to delete demo objects")?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = load_config(&cli)?;
    tracing::debug!(?config, "loaded configuration");

    let collector = Arc::new(Collector::new());
    let instrumentation =
        Instrumentation::with_config(Arc::clone(&collector), config.instrumentation.clone());

    let store = Arc::new(MemoryS3::new().with_bucket(&cli.bucket));
    let handle = S3Handle::new("demo", store, &config.transfer);
    instrumentation.register(handle.target());

    let report = instrumentation.instrument();
    tracing::debug!(?report, "instrumentation report");

    run_workload(&cli, &handle)?;

    let snapshot = collector.get();
    let rendered = if cli.compact {
        serde_json::to_string(&snapshot)?
    } else {
        serde_json::to_string_pretty(&snapshot)?
    };
    println!("{}", rendered);

    instrumentation.revert();
    Ok(())
}
