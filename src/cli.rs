//! CLI argument parsing for the arcee demo workload

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// How objects are uploaded by the demo workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UploadMode {
    /// Direct put_object requests on the client
    Put,
    /// Through the transfer manager (multipart above the threshold)
    Transfer,
}

#[derive(Parser, Debug)]
#[command(name = "arcee")]
#[command(version)]
#[command(
    about = "Run an instrumented object storage workload and print the collected statistics",
    long_about = None
)]
pub struct Cli {
    /// Agent configuration file (TOML)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of objects to upload
    #[arg(short = 'n', long, default_value = "3")]
    pub objects: usize,

    /// Size of each object in bytes
    #[arg(short, long, value_name = "BYTES", default_value = "1024")]
    pub size: usize,

    /// Bucket the workload writes to
    #[arg(short, long, default_value = "arcee-demo")]
    pub bucket: String,

    /// Upload mode
    #[arg(long = "mode", value_enum, default_value = "transfer")]
    pub mode: UploadMode,

    /// Keep uploaded objects instead of deleting them at the end
    #[arg(long)]
    pub keep: bool,

    /// Print the snapshot as compact JSON
    #[arg(long)]
    pub compact: bool,

    /// Enable debug tracing output to stderr
    #[arg(long)]
    pub debug: bool,
}
