//! Per-method recording rules for S3 calls
//!
//! Bytes are counted wherever they actually move (`upload_part` always,
//! `put_object` unless re-entered, downloaded bodies as they are read).
//! File identity is only recorded for top-level calls so a transfer counts
//! its destination once no matter how many requests it issues.

use super::api::ObjectRef;
use crate::interceptor::{CallKind, Handler, InterceptedCall};
use crate::stats::Recorder;

/// An intercepted client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S3Call {
    PutObject {
        bucket: String,
        key: String,
        body_len: u64,
    },
    GetObject {
        bucket: String,
        key: String,
    },
    HeadObject {
        bucket: String,
        key: String,
    },
    DeleteObject {
        bucket: String,
        key: String,
    },
    DeleteObjects {
        bucket: String,
        keys: Vec<String>,
    },
    CopyObject {
        source: ObjectRef,
        destination: ObjectRef,
    },
    ListObjects {
        bucket: String,
        prefix: String,
    },
    CreateMultipartUpload {
        bucket: String,
        key: String,
    },
    UploadPart {
        bucket: String,
        key: String,
        part_number: u32,
        body_len: u64,
    },
    CompleteMultipartUpload {
        bucket: String,
        key: String,
    },
}

impl InterceptedCall for S3Call {
    fn method(&self) -> &str {
        match self {
            S3Call::PutObject { .. } => "put_object",
            S3Call::GetObject { .. } => "get_object",
            S3Call::HeadObject { .. } => "head_object",
            S3Call::DeleteObject { .. } => "delete_object",
            S3Call::DeleteObjects { .. } => "delete_objects",
            S3Call::CopyObject { .. } => "copy_object",
            S3Call::ListObjects { .. } => "list_objects",
            S3Call::CreateMultipartUpload { .. } => "create_multipart_upload",
            S3Call::UploadPart { .. } => "upload_part",
            S3Call::CompleteMultipartUpload { .. } => "complete_multipart_upload",
        }
    }
}

/// An intercepted transfer manager operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferCall {
    UploadFile { destination: ObjectRef },
    UploadFileobj { destination: ObjectRef },
    DownloadFile { source: ObjectRef },
    DownloadFileobj { source: ObjectRef },
    Copy { source: ObjectRef, destination: ObjectRef },
}

impl InterceptedCall for TransferCall {
    fn method(&self) -> &str {
        match self {
            TransferCall::UploadFile { .. } => "upload_file",
            TransferCall::UploadFileobj { .. } => "upload_fileobj",
            TransferCall::DownloadFile { .. } => "download_file",
            TransferCall::DownloadFileobj { .. } => "download_fileobj",
            TransferCall::Copy { .. } => "copy",
        }
    }
}

pub(crate) fn client_handlers() -> Vec<(&'static str, Handler<S3Call>)> {
    let handlers: [(&'static str, Handler<S3Call>); 6] = [
        ("put_object", put_object),
        ("upload_part", upload_part),
        ("get_object", object_access),
        ("delete_object", object_access),
        ("delete_objects", delete_objects),
        ("copy_object", copy_object),
    ];
    Vec::from(handlers)
}

pub(crate) fn transfer_handlers() -> Vec<(&'static str, Handler<TransferCall>)> {
    ["upload_file", "upload_fileobj", "download_file", "download_fileobj", "copy"]
        .into_iter()
        .map(|method| (method, transfer as Handler<TransferCall>))
        .collect()
}

fn put_object(recorder: &Recorder, service: &str, call: &S3Call, kind: CallKind) {
    let S3Call::PutObject {
        bucket,
        key,
        body_len,
    } = call
    else {
        return;
    };
    if kind.is_top_level() {
        recorder.count_file(service, bucket, key);
    }
    if !kind.rewrapped {
        recorder.count_uploaded_bytes(service, *body_len);
    }
}

fn upload_part(recorder: &Recorder, service: &str, call: &S3Call, _kind: CallKind) {
    if let S3Call::UploadPart { body_len, .. } = call {
        recorder.count_uploaded_bytes(service, *body_len);
    }
}

fn object_access(recorder: &Recorder, service: &str, call: &S3Call, kind: CallKind) {
    if !kind.is_top_level() {
        return;
    }
    match call {
        S3Call::GetObject { bucket, key } | S3Call::DeleteObject { bucket, key } => {
            recorder.count_file(service, bucket, key);
        }
        _ => {}
    }
}

fn delete_objects(recorder: &Recorder, service: &str, call: &S3Call, kind: CallKind) {
    if let (true, S3Call::DeleteObjects { bucket, keys }) = (kind.is_top_level(), call) {
        recorder.count_files(service, bucket, keys.iter().cloned());
    }
}

fn copy_object(recorder: &Recorder, service: &str, call: &S3Call, kind: CallKind) {
    if let (true, S3Call::CopyObject { source, destination }) = (kind.is_top_level(), call) {
        recorder.count_file(service, &source.bucket, &source.key);
        recorder.count_file(service, &destination.bucket, &destination.key);
    }
}

fn transfer(recorder: &Recorder, service: &str, call: &TransferCall, kind: CallKind) {
    if !kind.is_top_level() {
        return;
    }
    match call {
        TransferCall::UploadFile { destination } | TransferCall::UploadFileobj { destination } => {
            recorder.count_file(service, &destination.bucket, &destination.key);
        }
        TransferCall::DownloadFile { source } | TransferCall::DownloadFileobj { source } => {
            recorder.count_file(service, &source.bucket, &source.key);
        }
        TransferCall::Copy {
            source,
            destination,
        } => {
            recorder.count_file(service, &source.bucket, &source.key);
            recorder.count_file(service, &destination.bucket, &destination.key);
        }
    }
}
