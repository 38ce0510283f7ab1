//! Decorating S3 client and transfer manager

use std::io::{self, Read, Write};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use super::api::{ByteStream, CompletedPart, ObjectMeta, ObjectRef, S3Api, S3Error};
use super::handlers::{S3Call, TransferCall};
use super::transfer::{self, Transfer};
use crate::interceptor::MethodInterceptor;
use crate::stats::Recorder;

/// S3 client that records usage of the wrapped client
pub struct InstrumentedS3 {
    inner: Arc<dyn S3Api>,
    interceptor: Arc<MethodInterceptor<S3Call>>,
}

impl InstrumentedS3 {
    pub fn new(inner: Arc<dyn S3Api>, interceptor: Arc<MethodInterceptor<S3Call>>) -> Self {
        Self { inner, interceptor }
    }

    fn counted(&self, body: ByteStream) -> ByteStream {
        let recorder = self.interceptor.recorder().clone();
        let service = self.interceptor.service().to_string();
        body.map_reader(move |reader| {
            Box::new(CountingReader {
                inner: reader,
                recorder,
                service,
            })
        })
    }
}

impl S3Api for InstrumentedS3 {
    fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<ObjectMeta, S3Error> {
        let call = S3Call::PutObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            body_len: body.len() as u64,
        };
        self.interceptor
            .intercept(&call, || self.inner.put_object(bucket, key, body))
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<ByteStream, S3Error> {
        let call = S3Call::GetObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        let body = self
            .interceptor
            .intercept(&call, || self.inner.get_object(bucket, key, range))?;
        Ok(self.counted(body))
    }

    fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, S3Error> {
        let call = S3Call::HeadObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        self.interceptor
            .intercept(&call, || self.inner.head_object(bucket, key))
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), S3Error> {
        let call = S3Call::DeleteObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        self.interceptor
            .intercept(&call, || self.inner.delete_object(bucket, key))
    }

    fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), S3Error> {
        let call = S3Call::DeleteObjects {
            bucket: bucket.to_string(),
            keys: keys.to_vec(),
        };
        self.interceptor
            .intercept(&call, || self.inner.delete_objects(bucket, keys))
    }

    fn copy_object(
        &self,
        source: &ObjectRef,
        destination: &ObjectRef,
    ) -> Result<ObjectMeta, S3Error> {
        let call = S3Call::CopyObject {
            source: source.clone(),
            destination: destination.clone(),
        };
        self.interceptor
            .intercept(&call, || self.inner.copy_object(source, destination))
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, S3Error> {
        let call = S3Call::ListObjects {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        };
        self.interceptor
            .intercept(&call, || self.inner.list_objects(bucket, prefix))
    }

    fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, S3Error> {
        let call = S3Call::CreateMultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        self.interceptor
            .intercept(&call, || self.inner.create_multipart_upload(bucket, key))
    }

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &[u8],
    ) -> Result<CompletedPart, S3Error> {
        let call = S3Call::UploadPart {
            bucket: bucket.to_string(),
            key: key.to_string(),
            part_number,
            body_len: body.len() as u64,
        };
        self.interceptor.intercept(&call, || {
            self.inner
                .upload_part(bucket, key, upload_id, part_number, body)
        })
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectMeta, S3Error> {
        let call = S3Call::CompleteMultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        self.interceptor.intercept(&call, || {
            self.inner
                .complete_multipart_upload(bucket, key, upload_id, parts)
        })
    }
}

/// Transfer manager that records usage of the wrapped manager
pub struct InstrumentedTransfer {
    inner: Arc<dyn Transfer>,
    interceptor: Arc<MethodInterceptor<TransferCall>>,
}

impl InstrumentedTransfer {
    pub fn new(inner: Arc<dyn Transfer>, interceptor: Arc<MethodInterceptor<TransferCall>>) -> Self {
        Self { inner, interceptor }
    }
}

impl Transfer for InstrumentedTransfer {
    fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> transfer::Result<()> {
        let call = TransferCall::UploadFile {
            destination: ObjectRef::new(bucket, key),
        };
        self.interceptor
            .intercept(&call, || self.inner.upload_file(path, bucket, key))
    }

    fn upload_fileobj(&self, reader: &mut dyn Read, bucket: &str, key: &str) -> transfer::Result<()> {
        let call = TransferCall::UploadFileobj {
            destination: ObjectRef::new(bucket, key),
        };
        self.interceptor
            .intercept(&call, || self.inner.upload_fileobj(reader, bucket, key))
    }

    fn download_file(&self, bucket: &str, key: &str, path: &Path) -> transfer::Result<u64> {
        let call = TransferCall::DownloadFile {
            source: ObjectRef::new(bucket, key),
        };
        self.interceptor
            .intercept(&call, || self.inner.download_file(bucket, key, path))
    }

    fn download_fileobj(
        &self,
        bucket: &str,
        key: &str,
        writer: &mut dyn Write,
    ) -> transfer::Result<u64> {
        let call = TransferCall::DownloadFileobj {
            source: ObjectRef::new(bucket, key),
        };
        self.interceptor
            .intercept(&call, || self.inner.download_fileobj(bucket, key, writer))
    }

    fn copy(&self, source: &ObjectRef, destination: &ObjectRef) -> transfer::Result<()> {
        let call = TransferCall::Copy {
            source: source.clone(),
            destination: destination.clone(),
        };
        self.interceptor
            .intercept(&call, || self.inner.copy(source, destination))
    }
}

/// Reader that records every chunk read as downloaded bytes
struct CountingReader {
    inner: Box<dyn Read + Send>,
    recorder: Recorder,
    service: String,
}

impl Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read > 0 {
            self.recorder
                .count_downloaded_bytes(&self.service, read as u64);
        }
        Ok(read)
    }
}
