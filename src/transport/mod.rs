//! Transport layer for device-to-cloud communication
//!
//! This module provides the transport abstraction the runner is written
//! against, and the Azure IoT Hub MQTT implementation of it.
//!
//! The runner never touches the network itself: it calls `connect`, `send`,
//! `send_method_response` and `shutdown`, and registers one
//! [`TransportEvents`] handler through which the transport reports link
//! changes, cloud-to-device messages and direct-method requests.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub mod mqtt;

/// Transport trait for a single device connection
///
/// Implementations own their interior mutability: the runner shares one
/// transport between its reconnect loop, its send loop and the method
/// dispatcher.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open the connection to the broker.
    ///
    /// Must resolve only after the link-up state change has been reported
    /// to the registered event handler.
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Close the connection. Must tolerate an already broken link.
    async fn shutdown(&self) -> Result<(), Self::Error>;

    /// Deliver one telemetry message
    async fn send(&self, message: OutboundMessage) -> Result<(), Self::Error>;

    /// Answer a direct-method request
    async fn send_method_response(&self, response: MethodResponse) -> Result<(), Self::Error>;

    /// Register (or clear, with `None`) the handler for transport events
    fn set_event_handler(&self, handler: Option<Arc<dyn TransportEvents>>);
}

/// Callbacks invoked by a transport
///
/// Calls are made from the transport's own event task, one at a time, and
/// must not block.
pub trait TransportEvents: Send + Sync {
    /// The link to the broker went up (`true`) or down (`false`)
    fn on_connection_state_change(&self, connected: bool);

    /// A cloud-to-device message arrived
    fn on_message(&self, message: InboundMessage);

    /// A direct-method request arrived
    fn on_method_request(&self, request: MethodRequest);
}

/// A telemetry message ready to hand to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: String,
    pub content_type: String,
    pub content_encoding: String,
}

impl OutboundMessage {
    /// UTF-8 JSON telemetry body
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: "application/json".to_string(),
            content_encoding: "utf-8".to_string(),
        }
    }
}

/// A cloud-to-device message as received
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    pub properties: HashMap<String, String>,
}

impl InboundMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            properties: HashMap::new(),
        }
    }

    /// Decode the body: structured JSON when it parses, raw text otherwise
    pub fn decode(&self) -> InboundPayload {
        let text = String::from_utf8_lossy(&self.payload);
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => InboundPayload::Json(value),
            Err(_) => InboundPayload::Text(text.into_owned()),
        }
    }
}

/// Decoded cloud-to-device payload handed to the message callback
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    Json(Value),
    Text(String),
}

impl InboundPayload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            InboundPayload::Json(value) => Some(value),
            InboundPayload::Text(_) => None,
        }
    }
}

/// An inbound direct-method request
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRequest {
    /// Method name as invoked by the cloud
    pub name: String,
    /// Opaque id the response must echo
    pub request_id: String,
    /// JSON body (`Value::Null` when absent)
    pub payload: Value,
}

/// Response to a direct-method request
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    pub request_id: String,
    pub status: u16,
    pub payload: Value,
}

impl MethodResponse {
    /// Build a response addressed to `request`
    pub fn for_request(request: &MethodRequest, status: u16, payload: Value) -> Self {
        Self {
            request_id: request.request_id.clone(),
            status,
            payload,
        }
    }
}
