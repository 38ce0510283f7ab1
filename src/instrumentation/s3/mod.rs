//! Object storage instrumentation
//!
//! An [`S3Handle`] exposes three slots to the instrumentation:
//!
//! - `client`: the [`S3Api`] client, wrapped by [`InstrumentedS3`]
//! - `transfer`: the [`Transfer`] manager, wrapped by [`InstrumentedTransfer`]
//! - `executor`: the transfer worker pool, wrapped by a
//!   [`ContextExecutor`] so part requests are attributed to the transfer
//!   that issued them

pub mod api;
pub mod handlers;
pub mod memory;
pub mod transfer;
pub mod wrapper;

use std::sync::Arc;

pub use api::{ByteStream, CompletedPart, ObjectMeta, ObjectRef, S3Api, S3Error};
pub use memory::MemoryS3;
pub use transfer::{Transfer, TransferError, TransferManager};
pub use wrapper::{InstrumentedS3, InstrumentedTransfer};

use super::{InstrumentReport, Instrumentation};
use crate::config::TransferConfig;
use crate::executor::{BoundedExecutor, ContextExecutor, TaskExecutor};
use crate::interceptor::MethodInterceptor;
use crate::patch::{PatchTarget, Slot};
use crate::stats::{
    FieldDef, FieldKind, StatSchema, BYTES_DOWNLOADED, BYTES_UPLOADED, FILES_ACCESSED,
    METHOD_CALLS,
};

pub const PACKAGE: &str = "aws_sdk";
pub const SERVICE: &str = "s3";

pub const CLIENT_ATTR: &str = "client";
pub const TRANSFER_ATTR: &str = "transfer";
pub const EXECUTOR_ATTR: &str = "executor";

pub static S3_STATS: StatSchema = StatSchema {
    package: PACKAGE,
    service: Some(SERVICE),
    fields: &[
        FieldDef::new(METHOD_CALLS, FieldKind::Tally),
        FieldDef::new(BYTES_DOWNLOADED, FieldKind::Counter),
        FieldDef::new(BYTES_UPLOADED, FieldKind::Counter),
        FieldDef::new(FILES_ACCESSED, FieldKind::FileSet),
    ],
};

/// Host-side handle on an S3 client and its transfer manager
#[derive(Clone)]
pub struct S3Handle {
    client: Arc<Slot<dyn S3Api>>,
    transfer: Arc<Slot<dyn Transfer>>,
    executor: Arc<Slot<dyn TaskExecutor>>,
    target: Arc<PatchTarget>,
}

impl S3Handle {
    /// Handle with a [`BoundedExecutor`] sized from `config`
    pub fn new(name: &str, client: Arc<dyn S3Api>, config: &TransferConfig) -> Self {
        let executor: Arc<dyn TaskExecutor> = Arc::new(BoundedExecutor::new(config.max_workers.max(1)));
        Self::with_executor(name, client, executor, config)
    }

    pub fn with_executor(
        name: &str,
        client: Arc<dyn S3Api>,
        executor: Arc<dyn TaskExecutor>,
        config: &TransferConfig,
    ) -> Self {
        let client = Arc::new(Slot::new(client));
        let executor = Arc::new(Slot::new(executor));
        let manager: Arc<dyn Transfer> = Arc::new(TransferManager::new(
            Arc::clone(&client),
            Arc::clone(&executor),
            config.clone(),
        ));
        let transfer = Arc::new(Slot::new(manager));

        let target = PatchTarget::new(PACKAGE, SERVICE, name)
            .with_slot(CLIENT_ATTR, Arc::clone(&client))
            .with_slot(TRANSFER_ATTR, Arc::clone(&transfer))
            .with_slot(EXECUTOR_ATTR, Arc::clone(&executor));

        Self {
            client,
            transfer,
            executor,
            target: Arc::new(target),
        }
    }

    /// Current client implementation
    pub fn client(&self) -> Arc<dyn S3Api> {
        self.client.load()
    }

    /// Current transfer manager implementation
    pub fn transfer(&self) -> Arc<dyn Transfer> {
        self.transfer.load()
    }

    pub fn executor(&self) -> Arc<dyn TaskExecutor> {
        self.executor.load()
    }

    pub fn target(&self) -> Arc<PatchTarget> {
        Arc::clone(&self.target)
    }
}

impl std::fmt::Debug for S3Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Handle")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

pub(crate) fn instrument(instrumentation: &Instrumentation, report: &mut InstrumentReport) {
    instrumentation.registry().register(SERVICE, &S3_STATS);
    instrumentation.patches().revert(SERVICE);

    let targets = instrumentation.targets_for(SERVICE);
    if targets.is_empty() {
        tracing::debug!("no s3 targets registered");
        return;
    }

    let tracker = Arc::clone(instrumentation.tracker());
    let ignored = instrumentation.config().ignored_methods.clone();
    let client_interceptor = Arc::new(
        MethodInterceptor::new(SERVICE, Arc::clone(&tracker), instrumentation.recorder())
            .with_handlers(handlers::client_handlers())
            .with_ignored_methods(ignored.clone()),
    );
    let transfer_interceptor = Arc::new(
        MethodInterceptor::new(SERVICE, Arc::clone(&tracker), instrumentation.recorder())
            .with_handlers(handlers::transfer_handlers())
            .with_ignored_methods(ignored),
    );

    for target in targets {
        instrumentation.install(report, SERVICE, &target, CLIENT_ATTR, |inner: Arc<dyn S3Api>| {
            Arc::new(InstrumentedS3::new(inner, Arc::clone(&client_interceptor))) as Arc<dyn S3Api>
        });
        instrumentation.install(
            report,
            SERVICE,
            &target,
            TRANSFER_ATTR,
            |inner: Arc<dyn Transfer>| {
                Arc::new(InstrumentedTransfer::new(inner, Arc::clone(&transfer_interceptor)))
                    as Arc<dyn Transfer>
            },
        );
        instrumentation.install(
            report,
            SERVICE,
            &target,
            EXECUTOR_ATTR,
            |inner: Arc<dyn TaskExecutor>| {
                Arc::new(ContextExecutor::new(inner, Arc::clone(&tracker))) as Arc<dyn TaskExecutor>
            },
        );
    }
}
