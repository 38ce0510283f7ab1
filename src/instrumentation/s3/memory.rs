//! In-process object store

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::api::{ByteStream, CompletedPart, ObjectMeta, ObjectRef, S3Api, S3Error};

#[derive(Debug, Default)]
struct Upload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Debug, Default)]
struct Store {
    buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
    calls: HashMap<&'static str, usize>,
}

impl Store {
    fn bucket(&self, bucket: &str) -> Result<&BTreeMap<String, Vec<u8>>, S3Error> {
        self.buckets
            .get(bucket)
            .ok_or_else(|| S3Error::NoSuchBucket(bucket.to_string()))
    }

    fn bucket_mut(&mut self, bucket: &str) -> Result<&mut BTreeMap<String, Vec<u8>>, S3Error> {
        self.buckets
            .get_mut(bucket)
            .ok_or_else(|| S3Error::NoSuchBucket(bucket.to_string()))
    }

    fn object(&self, bucket: &str, key: &str) -> Result<&Vec<u8>, S3Error> {
        self.bucket(bucket)?
            .get(key)
            .ok_or_else(|| S3Error::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

/// Thread-safe in-memory S3 implementation
///
/// Buckets must be created before use. Every call is counted per method so
/// callers can check how often the store was actually reached.
#[derive(Debug, Default)]
pub struct MemoryS3 {
    store: Mutex<Store>,
}

impl MemoryS3 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(self, bucket: &str) -> Self {
        self.create_bucket(bucket);
        self
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.lock().buckets.entry(bucket.to_string()).or_default();
    }

    /// Raw object contents, bypassing call accounting
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock().object(bucket, key).ok().cloned()
    }

    /// How many times `method` reached the store
    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    fn enter(&self, method: &'static str) -> MutexGuard<'_, Store> {
        let mut store = self.lock();
        *store.calls.entry(method).or_insert(0) += 1;
        store
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn etag(body: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("\"{:016x}\"", hasher.finish())
}

fn meta(bucket: &str, key: &str, body: &[u8]) -> ObjectMeta {
    ObjectMeta {
        bucket: bucket.to_string(),
        key: key.to_string(),
        size: body.len() as u64,
        etag: etag(body),
    }
}

impl S3Api for MemoryS3 {
    fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<ObjectMeta, S3Error> {
        let mut store = self.enter("put_object");
        store.bucket_mut(bucket)?.insert(key.to_string(), body.to_vec());
        Ok(meta(bucket, key, body))
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<ByteStream, S3Error> {
        let store = self.enter("get_object");
        let body = store.object(bucket, key)?;
        let size = body.len() as u64;
        let slice = match range {
            None => body.clone(),
            Some(range) => {
                if range.start > range.end || range.end > size {
                    return Err(S3Error::InvalidRange {
                        start: range.start,
                        end: range.end,
                        size,
                    });
                }
                body[range.start as usize..range.end as usize].to_vec()
            }
        };
        Ok(ByteStream::from_bytes(slice))
    }

    fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, S3Error> {
        let store = self.enter("head_object");
        let body = store.object(bucket, key)?;
        Ok(meta(bucket, key, body))
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), S3Error> {
        let mut store = self.enter("delete_object");
        store.bucket_mut(bucket)?.remove(key);
        Ok(())
    }

    fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), S3Error> {
        let mut store = self.enter("delete_objects");
        let objects = store.bucket_mut(bucket)?;
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    fn copy_object(
        &self,
        source: &ObjectRef,
        destination: &ObjectRef,
    ) -> Result<ObjectMeta, S3Error> {
        let mut store = self.enter("copy_object");
        let body = store.object(&source.bucket, &source.key)?.clone();
        let meta = meta(&destination.bucket, &destination.key, &body);
        store
            .bucket_mut(&destination.bucket)?
            .insert(destination.key.clone(), body);
        Ok(meta)
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, S3Error> {
        let store = self.enter("list_objects");
        Ok(store
            .bucket(bucket)?
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, body)| meta(bucket, key, body))
            .collect())
    }

    fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, S3Error> {
        let mut store = self.enter("create_multipart_upload");
        store.bucket(bucket)?;
        store.next_upload += 1;
        let upload_id = format!("upload-{}", store.next_upload);
        store.uploads.insert(
            upload_id.clone(),
            Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: &[u8],
    ) -> Result<CompletedPart, S3Error> {
        let mut store = self.enter("upload_part");
        let upload = store
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| S3Error::NoSuchUpload(upload_id.to_string()))?;
        upload.parts.insert(part_number, body.to_vec());
        Ok(CompletedPart {
            part_number,
            etag: etag(body),
        })
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectMeta, S3Error> {
        let mut store = self.enter("complete_multipart_upload");
        let upload = store
            .uploads
            .remove(upload_id)
            .ok_or_else(|| S3Error::NoSuchUpload(upload_id.to_string()))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(S3Error::NoSuchUpload(upload_id.to_string()));
        }

        let mut body = Vec::new();
        for part in parts {
            let chunk = upload.parts.get(&part.part_number).ok_or_else(|| {
                S3Error::Service(format!("part {} was never uploaded", part.part_number))
            })?;
            body.extend_from_slice(chunk);
        }

        let meta = meta(bucket, key, &body);
        store.bucket_mut(bucket)?.insert(key.to_string(), body);
        Ok(meta)
    }
}
