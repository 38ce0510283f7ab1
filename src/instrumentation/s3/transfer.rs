//! High-level transfer manager
//!
//! Transfers run their S3 requests on a worker pool. Bodies at or above the
//! multipart threshold are split into parts that upload (or download) in
//! parallel; smaller ones run as a single pool task. The client and the
//! executor are resolved through slots on every operation, so patched
//! implementations take effect immediately.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::channel;
use thiserror::Error;

use super::api::{CompletedPart, ObjectRef, S3Api, S3Error};
use crate::config::TransferConfig;
use crate::executor::TaskExecutor;
use crate::patch::Slot;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    S3(#[from] S3Error),

    #[error("I/O error on {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("transfer pool dropped {0} task(s) before they reported")]
    WorkerLost(usize),
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// File and stream level transfers
pub trait Transfer: Send + Sync {
    fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> Result<()>;

    fn upload_fileobj(&self, reader: &mut dyn Read, bucket: &str, key: &str) -> Result<()>;

    /// Returns the number of bytes written to `path`
    fn download_file(&self, bucket: &str, key: &str, path: &Path) -> Result<u64>;

    /// Returns the number of bytes written to `writer`
    fn download_fileobj(&self, bucket: &str, key: &str, writer: &mut dyn Write) -> Result<u64>;

    fn copy(&self, source: &ObjectRef, destination: &ObjectRef) -> Result<()>;
}

type Job<T> = Box<dyn FnOnce() -> std::result::Result<T, S3Error> + Send>;

/// Transfer implementation over an [`S3Api`] client and a [`TaskExecutor`]
pub struct TransferManager {
    client: Arc<Slot<dyn S3Api>>,
    executor: Arc<Slot<dyn TaskExecutor>>,
    config: TransferConfig,
}

impl TransferManager {
    pub fn new(
        client: Arc<Slot<dyn S3Api>>,
        executor: Arc<Slot<dyn TaskExecutor>>,
        config: TransferConfig,
    ) -> Self {
        Self {
            client,
            executor,
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn part_size(&self) -> u64 {
        self.config.part_size.max(1)
    }

    fn upload_bytes(&self, body: Vec<u8>, bucket: &str, key: &str) -> Result<()> {
        let client = self.client.load();

        if (body.len() as u64) < self.config.multipart_threshold {
            let (bucket, key) = (bucket.to_string(), key.to_string());
            let job: Job<()> = Box::new(move || client.put_object(&bucket, &key, &body).map(|_| ()));
            self.run_all(vec![job])?;
            return Ok(());
        }

        let upload_id = client.create_multipart_upload(bucket, key)?;
        let jobs: Vec<Job<CompletedPart>> = body
            .chunks(self.part_size() as usize)
            .zip(1u32..)
            .map(|(chunk, part_number)| {
                let client = Arc::clone(&client);
                let (bucket, key, upload_id) =
                    (bucket.to_string(), key.to_string(), upload_id.clone());
                let chunk = chunk.to_vec();
                Box::new(move || client.upload_part(&bucket, &key, &upload_id, part_number, &chunk))
                    as Job<CompletedPart>
            })
            .collect();

        let parts = self.run_all(jobs)?;
        client.complete_multipart_upload(bucket, key, &upload_id, &parts)?;
        Ok(())
    }

    fn download_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let client = self.client.load();
        let size = client.head_object(bucket, key)?.size;

        let ranges: Vec<Option<std::ops::Range<u64>>> = if size < self.config.multipart_threshold {
            vec![None]
        } else {
            (0..size)
                .step_by(self.part_size() as usize)
                .map(|start| Some(start..(start + self.part_size()).min(size)))
                .collect()
        };

        let jobs: Vec<Job<Vec<u8>>> = ranges
            .into_iter()
            .map(|range| {
                let client = Arc::clone(&client);
                let (bucket, key) = (bucket.to_string(), key.to_string());
                Box::new(move || -> std::result::Result<Vec<u8>, S3Error> {
                    let body = client.get_object(&bucket, &key, range)?;
                    Ok(body.collect()?)
                }) as Job<Vec<u8>>
            })
            .collect();

        Ok(self.run_all(jobs)?.concat())
    }

    /// Run jobs on the pool and return their results in submission order
    fn run_all<T: Send + 'static>(&self, jobs: Vec<Job<T>>) -> Result<Vec<T>> {
        let executor = self.executor.load();
        let expected = jobs.len();
        let (tx, rx) = channel::unbounded();

        for (index, job) in jobs.into_iter().enumerate() {
            let tx = tx.clone();
            executor.submit(Box::new(move || {
                // receiver is gone only if the caller stopped waiting
                let _ = tx.send((index, job()));
            }));
        }
        drop(tx);

        let mut results: Vec<Option<T>> = (0..expected).map(|_| None).collect();
        let mut first_error = None;
        for received in 0..expected {
            let Ok((index, outcome)) = rx.recv() else {
                return Err(TransferError::WorkerLost(expected - received));
            };
            match outcome {
                Ok(value) => results[index] = Some(value),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err.into());
        }
        Ok(results.into_iter().flatten().collect())
    }
}

impl Transfer for TransferManager {
    fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> Result<()> {
        let mut file = File::open(path).map_err(|source| TransferError::File {
            path: path.to_path_buf(),
            source,
        })?;
        let mut body = Vec::new();
        file.read_to_end(&mut body)
            .map_err(|source| TransferError::File {
                path: path.to_path_buf(),
                source,
            })?;
        self.upload_bytes(body, bucket, key)
    }

    fn upload_fileobj(&self, reader: &mut dyn Read, bucket: &str, key: &str) -> Result<()> {
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        self.upload_bytes(body, bucket, key)
    }

    fn download_file(&self, bucket: &str, key: &str, path: &Path) -> Result<u64> {
        let body = self.download_bytes(bucket, key)?;
        std::fs::write(path, &body).map_err(|source| TransferError::File {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(body.len() as u64)
    }

    fn download_fileobj(&self, bucket: &str, key: &str, writer: &mut dyn Write) -> Result<u64> {
        let body = self.download_bytes(bucket, key)?;
        writer.write_all(&body)?;
        Ok(body.len() as u64)
    }

    fn copy(&self, source: &ObjectRef, destination: &ObjectRef) -> Result<()> {
        let client = self.client.load();
        let (source, destination) = (source.clone(), destination.clone());
        let job: Job<()> = Box::new(move || client.copy_object(&source, &destination).map(|_| ()));
        self.run_all(vec![job])?;
        Ok(())
    }
}
