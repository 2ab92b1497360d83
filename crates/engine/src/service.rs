//! Service contract and registry.
//!
//! Every capability the runtime can invoke is a [`Service`]: it names
//! itself, decodes an attribute map into its own typed request, and runs
//! that request against a context. Requests travel as a closed set of
//! typed variants per service, decoded explicitly; decode failures are
//! errors, never panics.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::{EngineError, EngineResult};

/// Response status for a successful invocation.
pub const STATUS_OK: &str = "ok";
/// Response status for a failed invocation.
pub const STATUS_ERR: &str = "err";

/// A decoded service request.
///
/// Carries the typed request (recovered with [`ServiceRequest::take`]) plus
/// the canonical JSON form used for activity capture and event payloads.
pub struct ServiceRequest {
    service: String,
    action: String,
    payload: Value,
    inner: Box<dyn Any + Send>,
}

impl ServiceRequest {
    /// Decode an attribute map into a typed request.
    pub fn decode<T>(service: &str, action: &str, payload: Value) -> EngineResult<ServiceRequest>
    where
        T: DeserializeOwned + Serialize + Send + 'static,
    {
        let typed: T = serde_json::from_value(payload).map_err(|e| EngineError::RequestDecode {
            service: service.to_string(),
            action: action.to_string(),
            message: e.to_string(),
        })?;
        let canonical = serde_json::to_value(&typed)?;
        Ok(ServiceRequest {
            service: service.to_string(),
            action: action.to_string(),
            payload: canonical,
            inner: Box::new(typed),
        })
    }

    /// Service id this request targets.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Action name this request targets.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Canonical JSON form of the decoded request.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Recover the typed request.
    pub fn take<T: 'static>(self) -> EngineResult<T> {
        let service = self.service;
        let action = self.action;
        self.inner
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| EngineError::RequestDecode {
                service,
                action,
                message: "request type mismatch".to_string(),
            })
    }
}

impl std::fmt::Debug for ServiceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRequest")
            .field("service", &self.service)
            .field("action", &self.action)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Uniform response envelope shared by all services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceResponse {
    pub status: String,
    pub error: String,
    pub response: Value,
}

impl ServiceResponse {
    /// Successful response carrying a payload.
    pub fn ok(response: Value) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            error: String::new(),
            response,
        }
    }

    /// Failed response carrying an error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERR.to_string(),
            error: message.into(),
            response: Value::Null,
        }
    }

    /// Build a response from a result.
    pub fn from_result(result: EngineResult<Value>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(e) => Self::error(e.to_string()),
        }
    }

    /// Whether the invocation succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// A plug-in handler exposing a set of named actions.
#[async_trait]
pub trait Service: Send + Sync {
    /// Unique service id.
    fn id(&self) -> &str;

    /// Decode a request payload for the named action.
    fn new_request(&self, action: &str, payload: Value) -> EngineResult<ServiceRequest>;

    /// Run a decoded request against a context.
    async fn run(self: Arc<Self>, context: &Context, request: ServiceRequest) -> ServiceResponse;
}

/// Registry mapping service ids to service handles.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its own id.
    pub fn register(&self, service: Arc<dyn Service>) {
        let mut services = self.services.write().expect("service registry lock poisoned");
        services.insert(service.id().to_string(), service);
    }

    /// Look up a service by id.
    pub fn get(&self, id: &str) -> EngineResult<Arc<dyn Service>> {
        let services = self.services.read().expect("service registry lock poisoned");
        services
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::ServiceNotFound(id.to_string()))
    }

    /// Whether a service is registered.
    pub fn has(&self, id: &str) -> bool {
        let services = self.services.read().expect("service registry lock poisoned");
        services.contains_key(id)
    }

    /// Registered service ids.
    pub fn ids(&self) -> Vec<String> {
        let services = self.services.read().expect("service registry lock poisoned");
        services.keys().cloned().collect()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry").field("services", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct PingRequest {
        #[serde(default)]
        message: String,
    }

    struct PingService;

    #[async_trait]
    impl Service for PingService {
        fn id(&self) -> &str {
            "ping"
        }

        fn new_request(&self, action: &str, payload: Value) -> EngineResult<ServiceRequest> {
            match action {
                "ping" => ServiceRequest::decode::<PingRequest>(self.id(), action, payload),
                _ => Err(EngineError::UnknownAction {
                    service: self.id().to_string(),
                    action: action.to_string(),
                }),
            }
        }

        async fn run(self: Arc<Self>, _context: &Context, request: ServiceRequest) -> ServiceResponse {
            match request.take::<PingRequest>() {
                Ok(req) => ServiceResponse::ok(json!({"echo": req.message})),
                Err(e) => ServiceResponse::error(e.to_string()),
            }
        }
    }

    #[test]
    fn test_decode_and_take() {
        let request =
            ServiceRequest::decode::<PingRequest>("ping", "ping", json!({"message": "hi"})).unwrap();
        assert_eq!(request.service(), "ping");
        assert_eq!(request.action(), "ping");
        assert_eq!(request.payload()["message"], "hi");
        let typed: PingRequest = request.take().unwrap();
        assert_eq!(typed.message, "hi");
    }

    #[test]
    fn test_decode_failure_names_service_and_action() {
        let err = ServiceRequest::decode::<PingRequest>("ping", "ping", json!([1, 2])).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("ping.ping"), "unexpected error: {}", text);
    }

    #[test]
    fn test_take_wrong_type_fails() {
        let request =
            ServiceRequest::decode::<PingRequest>("ping", "ping", json!({"message": "x"})).unwrap();
        assert!(request.take::<String>().is_err());
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(PingService));
        assert!(registry.has("ping"));
        assert!(registry.get("missing").is_err());

        let engine = crate::context::Engine::new();
        let context = engine.new_context("s-test");
        let service = registry.get("ping").unwrap();
        let request = service.new_request("ping", json!({"message": "hello"})).unwrap();
        let response = service.run(&context, request).await;
        assert!(response.is_ok());
        assert_eq!(response.response["echo"], "hello");
    }

    #[test]
    fn test_unknown_action() {
        let service = PingService;
        let err = service.new_request("nope", json!({})).unwrap_err();
        assert!(matches!(err, EngineError::UnknownAction { .. }));
    }
}
