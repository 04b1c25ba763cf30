//! Mock transport for testing
//!
//! Scripted in-memory [`Transport`] that records everything the runner does
//! and lets a test drive the transport side: link drops, C2D messages and
//! direct-method requests.

use crate::transport::{
    InboundMessage, MethodRequest, MethodResponse, OutboundMessage, Transport, TransportEvents,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Failures produced by [`MockTransport`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MockTransportError {
    #[error("mock connection refused")]
    ConnectRefused,
    #[error("mock send failure")]
    SendFailed,
    #[error("mock transport is not connected")]
    NotConnected,
    #[error("mock method response failure")]
    ResponseFailed,
}

#[derive(Default)]
struct MockState {
    connect_script: VecDeque<bool>,
    send_failures: usize,
    connect_times: Vec<Instant>,
    sent: Vec<OutboundMessage>,
    responses: Vec<MethodResponse>,
    handler: Option<Arc<dyn TransportEvents>>,
}

/// Mock transport for testing
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    connected: AtomicBool,
    refuse_connections: AtomicBool,
    hang_connect: AtomicBool,
    hang_send: AtomicBool,
    fail_responses: AtomicBool,
    send_attempts: AtomicUsize,
    shutdowns: AtomicUsize,
    connect_delay_ms: AtomicUsize,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("connected", &self.is_connected())
            .field("connect_attempts", &self.connect_attempts())
            .field("send_attempts", &self.send_attempts())
            .finish()
    }
}

impl MockTransport {
    /// Transport whose connects succeed and sends go through
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that refuses every connection
    pub fn with_failure() -> Self {
        let transport = Self::new();
        transport.refuse_connections(true);
        transport
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- scripting ---------------------------------------------------------

    /// Queue outcomes for the next connects (`true` = success); once the
    /// script runs out, connects follow [`MockTransport::refuse_connections`]
    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.lock().connect_script.extend(outcomes);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make `connect` wait forever (until the caller gives up on it)
    pub fn hang_connect(&self, hang: bool) {
        self.hang_connect.store(hang, Ordering::SeqCst);
    }

    /// Delay every connect before it resolves
    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Fail the next `count` sends
    pub fn fail_next_sends(&self, count: usize) {
        self.lock().send_failures = count;
    }

    /// Make `send` wait forever (until the caller gives up on it)
    pub fn hang_send(&self, hang: bool) {
        self.hang_send.store(hang, Ordering::SeqCst);
    }

    pub fn fail_method_responses(&self, fail: bool) {
        self.fail_responses.store(fail, Ordering::SeqCst);
    }

    // -- injection ---------------------------------------------------------

    fn event_handler(&self) -> Option<Arc<dyn TransportEvents>> {
        self.lock().handler.clone()
    }

    /// Report a link change as the broker connection would.
    ///
    /// Returns `false` when no event handler is registered.
    pub fn report_link(&self, connected: bool) -> bool {
        self.connected.store(connected, Ordering::SeqCst);
        match self.event_handler() {
            Some(handler) => {
                handler.on_connection_state_change(connected);
                true
            }
            None => false,
        }
    }

    /// Simulate the broker dropping the connection
    pub fn drop_link(&self) -> bool {
        self.report_link(false)
    }

    /// Deliver a C2D message; `false` when no event handler is registered
    pub fn inject_message(&self, payload: impl Into<Vec<u8>>) -> bool {
        match self.event_handler() {
            Some(handler) => {
                handler.on_message(InboundMessage::new(payload));
                true
            }
            None => false,
        }
    }

    /// Deliver a direct-method request; `false` when no event handler is registered
    pub fn inject_method(&self, name: &str, request_id: &str, payload: Value) -> bool {
        match self.event_handler() {
            Some(handler) => {
                handler.on_method_request(MethodRequest {
                    name: name.to_string(),
                    request_id: request_id.to_string(),
                    payload,
                });
                true
            }
            None => false,
        }
    }

    // -- inspection --------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn has_event_handler(&self) -> bool {
        self.lock().handler.is_some()
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_times.len()
    }

    /// When each connect attempt started
    pub fn connect_times(&self) -> Vec<Instant> {
        self.lock().connect_times.clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Successfully sent messages, in send order
    pub fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.lock().sent.clone()
    }

    /// Successfully sent telemetry bodies, parsed back to JSON
    pub fn sent_payloads(&self) -> Vec<Value> {
        self.lock()
            .sent
            .iter()
            .filter_map(|message| serde_json::from_str(&message.body).ok())
            .collect()
    }

    pub fn method_responses(&self) -> Vec<MethodResponse> {
        self.lock().responses.clone()
    }

    /// Poll until `condition` holds or `timeout` elapses
    pub async fn wait_until(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        condition(self)
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn connect(&self) -> Result<(), Self::Error> {
        let succeed = {
            let mut state = self.lock();
            state.connect_times.push(Instant::now());
            state
                .connect_script
                .pop_front()
                .unwrap_or(!self.refuse_connections.load(Ordering::SeqCst))
        };

        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        if !succeed {
            return Err(MockTransportError::ConnectRefused);
        }
        self.report_link(true);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), Self::Error> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang_send.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !self.is_connected() {
            return Err(MockTransportError::NotConnected);
        }

        let mut state = self.lock();
        if state.send_failures > 0 {
            state.send_failures -= 1;
            return Err(MockTransportError::SendFailed);
        }
        state.sent.push(message);
        Ok(())
    }

    async fn send_method_response(&self, response: MethodResponse) -> Result<(), Self::Error> {
        if self.fail_responses.load(Ordering::SeqCst) {
            return Err(MockTransportError::ResponseFailed);
        }
        self.lock().responses.push(response);
        Ok(())
    }

    fn set_event_handler(&self, handler: Option<Arc<dyn TransportEvents>>) {
        self.lock().handler = handler;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_connects() {
        let transport = MockTransport::new();
        transport.script_connects([false, true]);

        assert_eq!(
            transport.connect().await,
            Err(MockTransportError::ConnectRefused)
        );
        assert!(transport.connect().await.is_ok());
        assert!(transport.is_connected());
        assert_eq!(transport.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = MockTransport::new();
        let result = transport.send(OutboundMessage::json("{}")).await;
        assert_eq!(result, Err(MockTransportError::NotConnected));

        transport.connect().await.unwrap();
        transport.fail_next_sends(1);
        assert!(transport.send(OutboundMessage::json("{}")).await.is_err());
        assert!(transport.send(OutboundMessage::json("{\"a\":1}")).await.is_ok());
        assert_eq!(transport.sent_payloads(), vec![serde_json::json!({"a": 1})]);
        assert_eq!(transport.send_attempts(), 3);
    }

    #[test]
    fn test_injection_without_handler() {
        let transport = MockTransport::new();
        assert!(!transport.inject_message(b"x".to_vec()));
        assert!(!transport.inject_method("m", "1", Value::Null));
        assert!(!transport.has_event_handler());
    }
}
