//! Object storage capability

use std::fmt;
use std::io::{self, Read};
use std::ops::Range;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum S3Error {
    #[error("bucket '{0}' does not exist")]
    NoSuchBucket(String),

    #[error("object '{bucket}/{key}' does not exist")]
    NoSuchKey { bucket: String, key: String },

    #[error("multipart upload '{0}' does not exist")]
    NoSuchUpload(String),

    #[error("invalid range {start}..{end} for an object of {size} bytes")]
    InvalidRange { start: u64, end: u64, size: u64 },

    #[error("service error: {0}")]
    Service(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Bucket and key of one object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Streaming object body
pub struct ByteStream {
    reader: Box<dyn Read + Send>,
    content_length: u64,
}

impl ByteStream {
    pub fn new(reader: impl Read + Send + 'static, content_length: u64) -> Self {
        Self {
            reader: Box::new(reader),
            content_length,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self::new(io::Cursor::new(bytes), len)
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Read the remaining body into memory
    pub fn collect(mut self) -> io::Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.content_length as usize);
        self.reader.read_to_end(&mut body)?;
        Ok(body)
    }

    /// Replace the underlying reader, keeping the length
    pub(crate) fn map_reader<F>(self, wrap: F) -> Self
    where
        F: FnOnce(Box<dyn Read + Send>) -> Box<dyn Read + Send>,
    {
        Self {
            reader: wrap(self.reader),
            content_length: self.content_length,
        }
    }
}

impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Operations of an object storage client
pub trait S3Api: Send + Sync {
    fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<ObjectMeta, S3Error>;

    /// Fetch an object, or a byte range of it
    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<ByteStream, S3Error>;

    fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, S3Error>;

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), S3Error>;

    fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), S3Error>;

    fn copy_object(
        &self,
        source: &ObjectRef,
        destination: &ObjectRef,
    ) -> Result<ObjectMeta, S3Error>;

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, S3Error>;

    /// Start a multipart upload; returns its id
    fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, S3Error>;

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &[u8],
    ) -> Result<CompletedPart, S3Error>;

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectMeta, S3Error>;
}
