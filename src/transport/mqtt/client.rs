//! Impure I/O for the IoT Hub MQTT client
//!
//! Each `connect` builds a fresh `rumqttc` client and event loop (a new SAS
//! token per connection) and spawns a poll task that turns broker events into
//! [`TransportEvents`] callbacks. The poll task never reconnects on its own:
//! on the first event-loop error it reports the link down and ends, leaving
//! reconnection to the runner.

use super::connection::{configure_mqtt_options, ConnectionString, MqttError, TopicBuilder, TransportSettings};
use super::message_handler::{EventRoute, MessageHandler};
use crate::transport::{MethodResponse, OutboundMessage, Transport, TransportEvents};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `shutdown` lets the poll task flush the DISCONNECT packet
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

type HandlerSlot = Arc<RwLock<Option<Arc<dyn TransportEvents>>>>;

/// Pairs QoS 1 publishes with their PubAcks.
///
/// Waiters are registered in publish order; the event loop assigns packet
/// ids in the same order, so the oldest unassigned waiter owns the next id.
#[derive(Default)]
struct AckTracker {
    unassigned: VecDeque<oneshot::Sender<()>>,
    in_flight: HashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    fn expect_ack(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.unassigned.push_back(tx);
        rx
    }

    fn withdraw_last(&mut self) {
        self.unassigned.pop_back();
    }

    fn sent(&mut self, pkid: u16) {
        if let Some(waiter) = self.unassigned.pop_front() {
            self.in_flight.insert(pkid, waiter);
        }
    }

    fn acknowledged(&mut self, pkid: u16) {
        if let Some(waiter) = self.in_flight.remove(&pkid) {
            // The sender may have timed out already
            let _ = waiter.send(());
        }
    }

    /// Drop every waiter; their receivers observe the link loss
    fn fail_all(&mut self) {
        self.unassigned.clear();
        self.in_flight.clear();
    }
}

type SharedAcks = Arc<Mutex<AckTracker>>;

fn lock_acks(acks: &Mutex<AckTracker>) -> MutexGuard<'_, AckTracker> {
    acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One live broker connection; dropping it stops the poll task
struct Session {
    client: AsyncClient,
    poll_task: JoinHandle<()>,
    link_up: Arc<AtomicBool>,
}

impl Drop for Session {
    fn drop(&mut self) {
        // A connect cancelled while waiting for ConnAck drops the session here
        self.poll_task.abort();
    }
}

/// Everything the poll task needs, detached from the client
struct PollContext {
    device_id: String,
    topics: TopicBuilder,
    handler: HandlerSlot,
    acks: SharedAcks,
    link_up: Arc<AtomicBool>,
}

impl PollContext {
    fn notify(&self, f: impl FnOnce(&dyn TransportEvents)) {
        let handler = match self.handler.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(handler) = handler {
            f(handler.as_ref());
        }
    }

    fn report_down(&self) {
        lock_acks(&self.acks).fail_all();
        if self.link_up.swap(false, Ordering::SeqCst) {
            self.notify(|handler| handler.on_connection_state_change(false));
        }
    }

    async fn run(self, mut event_loop: EventLoop, connack: oneshot::Sender<Result<(), MqttError>>) {
        let mut connack = Some(connack);

        loop {
            let event = match event_loop.poll().await {
                Ok(event) => event,
                Err(e) => {
                    match connack.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(MqttError::ConnectionFailed(e.to_string())));
                        }
                        None => warn!(device_id = %self.device_id, error = %e, "MQTT connection lost"),
                    }
                    self.report_down();
                    break;
                }
            };

            match MessageHandler::route_event(&event, &self.topics) {
                EventRoute::ConnectionAccepted => {
                    self.link_up.store(true, Ordering::SeqCst);
                    self.notify(|handler| handler.on_connection_state_change(true));
                    if let Some(tx) = connack.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                EventRoute::ConnectionRefused(code) => {
                    if let Some(tx) = connack.take() {
                        let _ = tx.send(Err(MqttError::ConnectionRefused(code)));
                    }
                    self.report_down();
                    break;
                }
                EventRoute::CloudMessage(message) => {
                    debug!(
                        device_id = %self.device_id,
                        bytes = message.payload.len(),
                        "C2D message received"
                    );
                    self.notify(|handler| handler.on_message(message));
                }
                EventRoute::MethodInvoked(request) => {
                    debug!(
                        device_id = %self.device_id,
                        method = %request.name,
                        request_id = %request.request_id,
                        "Direct method invoked"
                    );
                    self.notify(|handler| handler.on_method_request(request));
                }
                EventRoute::PublishSent(pkid) => lock_acks(&self.acks).sent(pkid),
                EventRoute::PublishAcknowledged(pkid) => lock_acks(&self.acks).acknowledged(pkid),
                EventRoute::SubscriptionConfirmed { accepted } => {
                    if accepted {
                        debug!(device_id = %self.device_id, "Subscription confirmed");
                    } else {
                        error!(device_id = %self.device_id, "IoT Hub rejected a subscription");
                    }
                }
                EventRoute::Disconnected => {
                    warn!(device_id = %self.device_id, "IoT Hub closed the connection");
                    self.report_down();
                    break;
                }
                EventRoute::DisconnectSent => {
                    self.report_down();
                    break;
                }
                EventRoute::Unrouted(topic) => {
                    debug!(device_id = %self.device_id, topic = %topic, "Ignoring publish on unexpected topic");
                }
                EventRoute::Other => {}
            }
        }

        debug!(device_id = %self.device_id, "MQTT poll task stopped");
    }
}

/// Azure IoT Hub device client over MQTT 3.1.1
pub struct IotHubClient {
    connection: ConnectionString,
    settings: TransportSettings,
    topics: TopicBuilder,
    session: tokio::sync::Mutex<Option<Session>>,
    handler: HandlerSlot,
    acks: SharedAcks,
}

impl std::fmt::Debug for IotHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IotHubClient")
            .field("connection", &self.connection)
            .field("settings", &self.settings)
            .finish()
    }
}

impl IotHubClient {
    pub fn new(connection: ConnectionString, settings: TransportSettings) -> Self {
        let topics = TopicBuilder::for_connection(&connection);
        Self {
            connection,
            settings,
            topics,
            session: tokio::sync::Mutex::new(None),
            handler: Arc::new(RwLock::new(None)),
            acks: Arc::new(Mutex::new(AckTracker::default())),
        }
    }

    /// Parse `connection_string` and build a client for it
    pub fn from_connection_string(
        connection_string: &str,
        settings: TransportSettings,
    ) -> Result<Self, MqttError> {
        Ok(Self::new(ConnectionString::parse(connection_string)?, settings))
    }

    pub fn device_id(&self) -> &str {
        &self.connection.device_id
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    fn now_unix() -> u64 {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
    }

    async fn current_client(&self) -> Result<AsyncClient, MqttError> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|session| !session.poll_task.is_finished())
            .map(|session| session.client.clone())
            .ok_or(MqttError::NotConnected)
    }

    /// Stop a session's poll task, reporting the link down if it was up
    fn abandon(&self, session: Session) {
        session.poll_task.abort();
        lock_acks(&self.acks).fail_all();
        if session.link_up.swap(false, Ordering::SeqCst) {
            let handler = match self.handler.read() {
                Ok(slot) => slot.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };
            if let Some(handler) = handler {
                handler.on_connection_state_change(false);
            }
        }
    }

    async fn open_session(&self) -> Result<Session, MqttError> {
        let options = configure_mqtt_options(&self.connection, &self.settings, Self::now_unix())?;
        let (client, event_loop) = AsyncClient::new(options, 10);

        // Queued now, sent by the event loop right after CONNECT
        for filter in self.topics.subscriptions() {
            client
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(MqttError::SubscriptionFailed)?;
        }

        let link_up = Arc::new(AtomicBool::new(false));
        let context = PollContext {
            device_id: self.connection.device_id.clone(),
            topics: self.topics.clone(),
            handler: Arc::clone(&self.handler),
            acks: Arc::clone(&self.acks),
            link_up: Arc::clone(&link_up),
        };
        let (connack_tx, connack_rx) = oneshot::channel();
        let poll_task = tokio::spawn(context.run(event_loop, connack_tx));
        let session = Session {
            client,
            poll_task,
            link_up,
        };

        let outcome = match tokio::time::timeout(self.settings.operation_timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(MqttError::ConnectionFailed("poll task ended before ConnAck".to_string())),
            Err(_) => Err(MqttError::ConnAckTimeout(self.settings.operation_timeout)),
        };

        match outcome {
            Ok(()) => Ok(session),
            Err(e) => {
                self.abandon(session);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Transport for IotHubClient {
    type Error = MqttError;

    async fn connect(&self) -> Result<(), Self::Error> {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            self.abandon(previous);
        }

        info!(
            device_id = %self.connection.device_id,
            host = %self.connection.broker_host(),
            "Opening MQTT connection to IoT Hub"
        );
        let session = self.open_session().await?;
        *slot = Some(session);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = session.client.try_disconnect() {
            debug!(device_id = %self.connection.device_id, error = %e, "Disconnect request not queued");
        }
        if tokio::time::timeout(DISCONNECT_GRACE, &mut session.poll_task)
            .await
            .is_err()
        {
            debug!(device_id = %self.connection.device_id, "Poll task did not stop in time, aborting");
        }
        self.abandon(session);
        info!(device_id = %self.connection.device_id, "MQTT connection closed");
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), Self::Error> {
        let client = self.current_client().await?;
        let topic = self
            .topics
            .telemetry(&message.content_type, &message.content_encoding);

        let ack = lock_acks(&self.acks).expect_ack();
        if let Err(e) = client
            .publish(topic, QoS::AtLeastOnce, false, message.body.into_bytes())
            .await
        {
            lock_acks(&self.acks).withdraw_last();
            return Err(MqttError::PublishFailed(e));
        }

        match tokio::time::timeout(self.settings.operation_timeout, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MqttError::LinkLost),
            Err(_) => Err(MqttError::AckTimeout(self.settings.operation_timeout)),
        }
    }

    async fn send_method_response(&self, response: MethodResponse) -> Result<(), Self::Error> {
        let client = self.current_client().await?;
        let topic = TopicBuilder::method_response(response.status, &response.request_id);
        let body = serde_json::to_vec(&response.payload)?;
        client
            .publish(topic, QoS::AtMostOnce, false, body)
            .await
            .map_err(MqttError::PublishFailed)
    }

    fn set_event_handler(&self, handler: Option<Arc<dyn TransportEvents>>) {
        match self.handler.write() {
            Ok(mut slot) => *slot = handler,
            Err(poisoned) => *poisoned.into_inner() = handler,
        }
    }
}
