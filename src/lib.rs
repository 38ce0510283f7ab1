//! Arcee - experiment tracking agent with runtime instrumentation
//!
//! This library records experiment metadata for a running job and instruments
//! the job's storage and query clients to collect usage statistics: bytes
//! moved, files touched, method call tallies and query history. Statistics
//! are accumulated concurrently and drained into one merged snapshot, which
//! the run heartbeat reports together with host and process statistics.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use arcee::collector::Collector;
//! use arcee::config::TransferConfig;
//! use arcee::instrumentation::Instrumentation;
//! use arcee::instrumentation::s3::{MemoryS3, S3Handle};
//!
//! let collector = Arc::new(Collector::new());
//! let instrumentation = Instrumentation::new(Arc::clone(&collector));
//!
//! let store = Arc::new(MemoryS3::new().with_bucket("models"));
//! let handle = S3Handle::new("default", store, &TransferConfig::default());
//! instrumentation.register(handle.target());
//! instrumentation.instrument();
//!
//! handle.client().put_object("models", "weights.bin", &[0u8; 128]).unwrap();
//!
//! let snapshot = collector.get();
//! assert_eq!(
//!     snapshot.field("aws_sdk", Some("s3"), "bytes_uploaded"),
//!     Some(&serde_json::json!(128))
//! );
//! ```

pub mod cli;
pub mod collector;
pub mod config;
pub mod console;
pub mod context;
pub mod environment;
pub mod executor;
pub mod heartbeat;
pub mod instrumentation;
pub mod interceptor;
pub mod patch;
pub mod proc;
pub mod session;
pub mod stats;
pub mod transport;
