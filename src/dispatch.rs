//! Direct-method registry and dispatcher
//!
//! A [`MethodRegistry`] maps method names to async handlers. It is not tied
//! to any device: [`MethodRegistry::create_dispatcher`] binds it to one
//! transport and device id, and the resulting [`MethodDispatcher`] answers
//! every inbound request with exactly one response.

use crate::error::sanitize_error_message;
use crate::transport::{MethodRequest, MethodResponse, Transport};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Status sent back for a method that ran successfully
pub const STATUS_OK: u16 = 200;
/// Status sent back when no handler is registered under the invoked name
pub const STATUS_UNKNOWN_METHOD: u16 = 400;
/// Status sent back when the handler failed or panicked
pub const STATUS_HANDLER_FAILED: u16 = 500;

/// Error returned by a method handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a method handler
pub type HandlerResult = Result<MethodOutcome, HandlerError>;

/// Status and body a handler wants sent back to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct MethodOutcome {
    pub status: u16,
    pub payload: Value,
}

impl MethodOutcome {
    pub fn new(status: u16, payload: Value) -> Self {
        Self { status, payload }
    }

    /// 200 with the given body
    pub fn ok(payload: Value) -> Self {
        Self::new(STATUS_OK, payload)
    }
}

/// Async handler for one direct method
///
/// Any `Fn(MethodRequest) -> impl Future<Output = HandlerResult>` is a
/// handler, so closures can be registered directly.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, request: MethodRequest) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(MethodRequest) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, request: MethodRequest) -> HandlerResult {
        (self)(request).await
    }
}

/// Name → handler map
#[derive(Clone, Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("handlers", &self.handler_names())
            .finish()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration; a later handler for the same name wins
    pub fn register<H>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        H: MethodHandler + 'static,
    {
        self.add_handler(name, handler);
        self
    }

    /// Register `handler` under `name`, replacing any previous one
    pub fn add_handler<H>(&mut self, name: impl Into<String>, handler: H)
    where
        H: MethodHandler + 'static,
    {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            debug!(method = %name, "Replaced direct method handler");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered method names, sorted
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Bind the registry to a transport and device
    pub fn create_dispatcher<T: Transport>(
        self: &Arc<Self>,
        transport: Arc<T>,
        device_id: impl Into<String>,
    ) -> MethodDispatcher<T> {
        MethodDispatcher {
            registry: Arc::clone(self),
            transport,
            device_id: device_id.into(),
        }
    }
}

/// Answers direct-method requests for one device
pub struct MethodDispatcher<T: Transport> {
    registry: Arc<MethodRegistry>,
    transport: Arc<T>,
    device_id: String,
}

impl<T: Transport> Clone for MethodDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            transport: Arc::clone(&self.transport),
            device_id: self.device_id.clone(),
        }
    }
}

impl<T: Transport> MethodDispatcher<T> {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Run the handler for `request` and send its response.
    ///
    /// Failing to deliver the response is logged, never returned.
    pub async fn dispatch(&self, request: MethodRequest) {
        let response = self.resolve(&request).await;
        debug!(
            device_id = %self.device_id,
            method = %request.name,
            request_id = %request.request_id,
            status = response.status,
            "Sending direct method response"
        );

        if let Err(e) = self.transport.send_method_response(response).await {
            warn!(
                device_id = %self.device_id,
                method = %request.name,
                request_id = %request.request_id,
                error = %e,
                "Failed to send direct method response"
            );
        }
    }

    /// Produce the response for `request` without sending it
    pub async fn resolve(&self, request: &MethodRequest) -> MethodResponse {
        let Some(handler) = self.registry.handler(&request.name) else {
            warn!(
                device_id = %self.device_id,
                method = %request.name,
                "Unknown direct method"
            );
            return MethodResponse::for_request(
                request,
                STATUS_UNKNOWN_METHOD,
                json!({"result": false, "data": format!("unknown method: {}", request.name)}),
            );
        };

        // Run on its own task so a panicking handler cannot take the
        // transport's event path down with it.
        let call = {
            let request = request.clone();
            tokio::spawn(async move { handler.call(request).await })
        };

        let failure = match call.await {
            Ok(Ok(outcome)) => {
                return MethodResponse::for_request(request, outcome.status, outcome.payload);
            }
            Ok(Err(e)) => e.to_string(),
            Err(join_error) if join_error.is_panic() => {
                format!("handler panicked: {}", panic_message(join_error.into_panic()))
            }
            Err(join_error) => join_error.to_string(),
        };

        error!(
            device_id = %self.device_id,
            method = %request.name,
            error = %failure,
            "Direct method handler failed"
        );
        MethodResponse::for_request(
            request,
            STATUS_HANDLER_FAILED,
            json!({"result": false, "error": sanitize_error_message(&failure)}),
        )
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
