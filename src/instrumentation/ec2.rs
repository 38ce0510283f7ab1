//! Generic cloud service API instrumentation
//!
//! Only method calls are tallied. A [`ServiceHandle`] is wrapped when its
//! service name is registered with a schema and equals [`SERVICE`].

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use super::{InstrumentReport, Instrumentation};
use crate::interceptor::{InterceptedCall, MethodInterceptor};
use crate::patch::{PatchTarget, Slot};
use crate::stats::{FieldDef, FieldKind, StatSchema, METHOD_CALLS};

pub const PACKAGE: &str = "aws_sdk";
pub const SERVICE: &str = "ec2";
pub const API_ATTR: &str = "api";

pub static EC2_STATS: StatSchema = StatSchema {
    package: PACKAGE,
    service: Some(SERVICE),
    fields: &[FieldDef::new(METHOD_CALLS, FieldKind::Tally)],
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("{code}: {message}")]
    Service { code: String, message: String },
}

/// Operation-dispatching service client
pub trait ServiceApi: Send + Sync {
    fn service_name(&self) -> &str;

    fn call(&self, operation: &str, params: &Value) -> Result<Value, ApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    pub operation: String,
}

impl InterceptedCall for ApiCall {
    fn method(&self) -> &str {
        &self.operation
    }
}

pub struct InstrumentedApi {
    inner: Arc<dyn ServiceApi>,
    interceptor: Arc<MethodInterceptor<ApiCall>>,
}

impl InstrumentedApi {
    pub fn new(inner: Arc<dyn ServiceApi>, interceptor: Arc<MethodInterceptor<ApiCall>>) -> Self {
        Self { inner, interceptor }
    }
}

impl ServiceApi for InstrumentedApi {
    fn service_name(&self) -> &str {
        self.inner.service_name()
    }

    fn call(&self, operation: &str, params: &Value) -> Result<Value, ApiError> {
        let call = ApiCall {
            operation: operation.to_string(),
        };
        self.interceptor
            .intercept(&call, || self.inner.call(operation, params))
    }
}

/// Host-side handle on a service client
#[derive(Clone)]
pub struct ServiceHandle {
    api: Arc<Slot<dyn ServiceApi>>,
    target: Arc<PatchTarget>,
}

impl ServiceHandle {
    pub fn new(name: &str, api: Arc<dyn ServiceApi>) -> Self {
        let service = api.service_name().to_string();
        let api = Arc::new(Slot::new(api));
        let target = PatchTarget::new(PACKAGE, service, name).with_slot(API_ATTR, Arc::clone(&api));
        Self {
            api,
            target: Arc::new(target),
        }
    }

    pub fn api(&self) -> Arc<dyn ServiceApi> {
        self.api.load()
    }

    pub fn target(&self) -> Arc<PatchTarget> {
        Arc::clone(&self.target)
    }
}

pub(crate) fn instrument(instrumentation: &Instrumentation, report: &mut InstrumentReport) {
    instrumentation.registry().register(SERVICE, &EC2_STATS);
    instrumentation.patches().revert(SERVICE);

    let targets: Vec<_> = instrumentation
        .targets_for(SERVICE)
        .into_iter()
        .filter(|target| instrumentation.registry().is_registered(target.service()))
        .collect();
    if targets.is_empty() {
        return;
    }

    let interceptor = Arc::new(
        MethodInterceptor::new(
            SERVICE,
            Arc::clone(instrumentation.tracker()),
            instrumentation.recorder(),
        )
        .with_ignored_methods(instrumentation.config().ignored_methods.clone()),
    );

    for target in targets {
        instrumentation.install(report, SERVICE, &target, API_ATTR, |inner: Arc<dyn ServiceApi>| {
            Arc::new(InstrumentedApi::new(inner, Arc::clone(&interceptor))) as Arc<dyn ServiceApi>
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use serde_json::json;

    struct FakeApi {
        service: &'static str,
    }

    impl ServiceApi for FakeApi {
        fn service_name(&self) -> &str {
            self.service
        }

        fn call(&self, operation: &str, _params: &Value) -> Result<Value, ApiError> {
            match operation {
                "describe_instances" => Ok(json!({"Reservations": []})),
                "run_instances" => Err(ApiError::Service {
                    code: "UnauthorizedOperation".to_string(),
                    message: "not allowed".to_string(),
                }),
                other => Err(ApiError::UnknownOperation(other.to_string())),
            }
        }
    }

    fn setup(service: &'static str) -> (ServiceHandle, Instrumentation) {
        let handle = ServiceHandle::new("compute", Arc::new(FakeApi { service }));
        let instrumentation = Instrumentation::new(Arc::new(Collector::new()));
        instrumentation.register(handle.target());
        (handle, instrumentation)
    }

    #[test]
    fn test_calls_are_tallied() {
        let (handle, instrumentation) = setup("ec2");
        let report = instrumentation.instrument();
        assert_eq!(report.installed(SERVICE), 1);

        let api = handle.api();
        api.call("describe_instances", &json!({})).unwrap();
        api.call("describe_instances", &json!({})).unwrap();
        assert!(api.call("run_instances", &json!({})).is_err());

        assert_eq!(
            instrumentation.collector().get().to_json(),
            json!({"aws_sdk": {"ec2": {"method_calls": {"describe_instances": 2}}}})
        );
    }

    #[test]
    fn test_other_services_are_left_alone() {
        let (handle, instrumentation) = setup("sqs");
        let report = instrumentation.instrument();
        assert_eq!(report.installed(SERVICE), 0);

        handle.api().call("describe_instances", &json!({})).unwrap();
        assert!(instrumentation.collector().get().is_empty());
    }

    #[test]
    fn test_service_name_passes_through() {
        let (handle, instrumentation) = setup("ec2");
        instrumentation.instrument();
        assert_eq!(handle.api().service_name(), "ec2");
    }
}
