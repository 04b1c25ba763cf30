//! Per-device connection runner
//!
//! A [`DeviceRunner`] keeps one device attached to the broker. It owns the
//! link-state signals, the bounded outbound queue and the backoff state, and
//! drives two tasks over a shared transport:
//!
//! - the reconnect loop ([`reconnect`]), which reconnects with exponential
//!   backoff whenever the link is down;
//! - the send loop ([`sender`]), which drains the queue while the link is up
//!   and re-queues a reading at the tail when its send fails.
//!
//! The first task to finish ends the run: exit is latched and the other task
//! is awaited, so an error from either of them is reported. Then the event
//! handler is cleared and the transport is shut down. A runner is single-use.

mod reconnect;
mod sender;

use crate::backoff::{BackoffPolicy, BackoffState};
use crate::device::DeviceDescriptor;
use crate::device_span;
use crate::dispatch::{MethodDispatcher, MethodRegistry};
use crate::error::{EnqueueError, RunnerError, RunnerResult};
use crate::queue::OutboundQueue;
use crate::signal::{ConnectionSignals, LinkState};
use crate::transport::{InboundMessage, InboundPayload, MethodRequest, Transport, TransportEvents};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, error, info, warn, Instrument};

/// Default bound of the outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// How long teardown waits for the second loop once exit is latched
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback for cloud-to-device messages: `(device_id, payload)`
///
/// Invoked on the transport's event path; it must not block.
pub type MessageCallback = Arc<dyn Fn(&str, InboundPayload) + Send + Sync>;

/// Tunables for one runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    pub queue_capacity: usize,
    pub backoff: BackoffPolicy,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// State shared by the runner, its two loops and the event bridge
pub(crate) struct RunnerShared<T: Transport> {
    pub(crate) device: Arc<DeviceDescriptor>,
    pub(crate) transport: Arc<T>,
    pub(crate) signals: ConnectionSignals,
    pub(crate) queue: Arc<OutboundQueue<Value>>,
    pub(crate) backoff: Arc<Mutex<BackoffState>>,
    pub(crate) policy: BackoffPolicy,
}

impl<T: Transport> Clone for RunnerShared<T> {
    fn clone(&self) -> Self {
        Self {
            device: Arc::clone(&self.device),
            transport: Arc::clone(&self.transport),
            signals: self.signals.clone(),
            queue: Arc::clone(&self.queue),
            backoff: Arc::clone(&self.backoff),
            policy: self.policy,
        }
    }
}

impl<T: Transport> RunnerShared<T> {
    pub(crate) fn lock_backoff(&self) -> MutexGuard<'_, BackoffState> {
        lock_backoff(&self.backoff)
    }
}

fn lock_backoff(backoff: &Mutex<BackoffState>) -> MutexGuard<'_, BackoffState> {
    backoff.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps one device connected and its telemetry flowing
pub struct DeviceRunner<T: Transport + 'static> {
    shared: RunnerShared<T>,
}

impl<T: Transport + 'static> std::fmt::Debug for DeviceRunner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRunner")
            .field("device", &self.shared.device)
            .field("signals", &self.shared.signals.state())
            .field("pending", &self.shared.queue.len())
            .finish()
    }
}

impl<T: Transport + 'static> DeviceRunner<T> {
    /// Runner with default queue capacity and backoff policy
    pub fn new(device: DeviceDescriptor, transport: Arc<T>) -> Self {
        Self::with_options(device, transport, RunnerOptions::default())
    }

    /// # Panics
    ///
    /// If `options.queue_capacity` is zero.
    pub fn with_options(device: DeviceDescriptor, transport: Arc<T>, options: RunnerOptions) -> Self {
        Self {
            shared: RunnerShared {
                device: Arc::new(device),
                transport,
                signals: ConnectionSignals::new(),
                queue: Arc::new(OutboundQueue::new(options.queue_capacity)),
                backoff: Arc::new(Mutex::new(BackoffState::new())),
                policy: options.backoff,
            },
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.shared.device
    }

    pub fn device_id(&self) -> &str {
        self.shared.device.device_id()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }

    /// Link-state and exit signals of this runner
    pub fn signals(&self) -> &ConnectionSignals {
        &self.shared.signals
    }

    /// Readings waiting in the queue (an in-flight reading is not counted)
    pub fn pending_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Readings waiting in the queue, oldest first
    pub fn pending_snapshot(&self) -> Vec<Value> {
        self.shared.queue.snapshot()
    }

    /// Backoff counters as they are right now
    pub fn backoff_state(&self) -> BackoffState {
        self.shared.lock_backoff().clone()
    }

    /// Queue a raw reading, waiting for room if the queue is full.
    ///
    /// Fails with [`EnqueueError::Stopped`] once the runner is exiting.
    pub async fn enqueue(&self, reading: Value) -> Result<(), EnqueueError<Value>> {
        if self.shared.signals.is_exiting() {
            return Err(EnqueueError::Stopped(reading));
        }
        tokio::select! {
            biased;
            _ = self.shared.signals.wait_exit() => Err(EnqueueError::Stopped(reading)),
            _ = self.shared.queue.reserve() => {
                self.shared.queue.push_reserved(reading);
                Ok(())
            }
        }
    }

    /// Queue a raw reading without waiting; a full queue hands it back
    pub fn try_enqueue(&self, reading: Value) -> Result<(), EnqueueError<Value>> {
        if self.shared.signals.is_exiting() {
            return Err(EnqueueError::Stopped(reading));
        }
        self.shared.queue.try_push(reading).map_err(|reading| {
            debug!(
                device_id = self.device_id(),
                capacity = self.shared.queue.capacity(),
                "Outbound queue full"
            );
            EnqueueError::Full(reading)
        })
    }

    /// Request shutdown; the in-progress [`DeviceRunner::run`] does the teardown
    pub fn stop(&self) {
        if self.shared.signals.request_exit() {
            info!(device_id = self.device_id(), "Stop requested");
        }
    }

    /// Run until stopped or until reconnection gives up.
    ///
    /// C2D messages go to `on_message`, direct methods to a dispatcher built
    /// from `registry`. Returns `Ok(())` on a clean stop.
    pub async fn run(
        &self,
        on_message: Option<MessageCallback>,
        registry: Option<Arc<MethodRegistry>>,
    ) -> RunnerResult<()> {
        let span = device_span!(device_id = %self.device_id());
        self.run_inner(on_message, registry).instrument(span).await
    }

    async fn run_inner(
        &self,
        on_message: Option<MessageCallback>,
        registry: Option<Arc<MethodRegistry>>,
    ) -> RunnerResult<()> {
        let device_id = self.device_id().to_string();
        info!(
            device_id = %device_id,
            n_valves = self.shared.device.n_valves(),
            methods = ?registry.as_ref().map(|r| r.handler_names()),
            "Device runner starting"
        );

        let dispatcher = registry.map(|registry| {
            registry.create_dispatcher(Arc::clone(&self.shared.transport), device_id.clone())
        });
        let events = RunnerEvents {
            device_id: device_id.clone(),
            signals: self.shared.signals.clone(),
            backoff: Arc::clone(&self.shared.backoff),
            on_message,
            dispatcher,
            runtime: Handle::current(),
        };
        self.shared
            .transport
            .set_event_handler(Some(Arc::new(events)));

        let mut reconnect = tokio::spawn(
            reconnect::reconnect_loop(self.shared.clone()).in_current_span(),
        );
        let mut sender = tokio::spawn(sender::send_loop(self.shared.clone()).in_current_span());
        let mut guard = TeardownOnDrop {
            device_id: device_id.clone(),
            signals: self.shared.signals.clone(),
            transport: Arc::clone(&self.shared.transport),
            tasks: vec![reconnect.abort_handle(), sender.abort_handle()],
            armed: true,
        };

        let (reconnect_finished, first) = tokio::select! {
            joined = &mut reconnect => (true, task_outcome(&device_id, "reconnect", joined)),
            joined = &mut sender => (false, task_outcome(&device_id, "send", joined)),
        };
        let (mut remaining, remaining_name) = if reconnect_finished {
            (sender, "send")
        } else {
            (reconnect, "reconnect")
        };

        // Both loops race every wait against exit, so the other one ends promptly
        self.shared.signals.request_exit();
        let second = match tokio::time::timeout(TASK_DRAIN_TIMEOUT, &mut remaining).await {
            Ok(joined) => task_outcome(&device_id, remaining_name, joined),
            Err(_) => {
                warn!(
                    device_id = %device_id,
                    task = remaining_name,
                    "Task did not stop after exit, aborting it"
                );
                remaining.abort();
                match remaining.await {
                    Err(e) if e.is_cancelled() => Ok(()),
                    joined => task_outcome(&device_id, remaining_name, joined),
                }
            }
        };
        let result = first.and(second);
        guard.disarm();

        self.shared.transport.set_event_handler(None);
        if let Err(e) = self.shared.transport.shutdown().await {
            warn!(device_id = %device_id, error = %e, "Error while shutting down transport");
        }

        match &result {
            Ok(()) => info!(
                device_id = %device_id,
                pending = self.pending_len(),
                "Device runner stopped"
            ),
            Err(e) => error!(device_id = %device_id, error = %e, "Device runner failed"),
        }
        result
    }
}

fn task_outcome(
    device_id: &str,
    task: &'static str,
    joined: Result<RunnerResult<()>, JoinError>,
) -> RunnerResult<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(RunnerError::task_failed(device_id, task, "panicked")),
        Err(e) => Err(RunnerError::task_failed(device_id, task, e.to_string())),
    }
}

/// Tears the run down if `run` itself is dropped mid-flight: exit is
/// latched, both loops are aborted, the event handler is cleared and the
/// transport shutdown is spawned onto the runtime.
struct TeardownOnDrop<T: Transport + 'static> {
    device_id: String,
    signals: ConnectionSignals,
    transport: Arc<T>,
    tasks: Vec<AbortHandle>,
    armed: bool,
}

impl<T: Transport + 'static> TeardownOnDrop<T> {
    /// `run` reached its own teardown
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T: Transport + 'static> Drop for TeardownOnDrop<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.signals.request_exit();
        for task in &self.tasks {
            task.abort();
        }
        self.transport.set_event_handler(None);

        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let device_id = std::mem::take(&mut self.device_id);
        runtime.spawn(async move {
            if let Err(e) = transport.shutdown().await {
                warn!(device_id = %device_id, error = %e, "Error while shutting down transport");
            }
        });
    }
}

/// Routes transport callbacks into the runner
struct RunnerEvents<T: Transport + 'static> {
    device_id: String,
    signals: ConnectionSignals,
    backoff: Arc<Mutex<BackoffState>>,
    on_message: Option<MessageCallback>,
    dispatcher: Option<MethodDispatcher<T>>,
    runtime: Handle,
}

impl<T: Transport + 'static> TransportEvents for RunnerEvents<T> {
    fn on_connection_state_change(&self, connected: bool) {
        let link = if connected {
            lock_backoff(&self.backoff).reset();
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };

        if self.signals.set_link(link) {
            info!(device_id = %self.device_id, connected, "Connection state changed");
        } else {
            debug!(device_id = %self.device_id, connected, "Duplicate connection state report");
        }
    }

    fn on_message(&self, message: InboundMessage) {
        let Some(callback) = &self.on_message else {
            debug!(
                device_id = %self.device_id,
                bytes = message.payload.len(),
                "No message handler registered, dropping C2D message"
            );
            return;
        };
        callback(&self.device_id, message.decode());
    }

    fn on_method_request(&self, request: MethodRequest) {
        let Some(dispatcher) = &self.dispatcher else {
            warn!(
                device_id = %self.device_id,
                method = %request.name,
                "No method registry, ignoring direct method request"
            );
            return;
        };

        let dispatcher = dispatcher.clone();
        let span = crate::method_span!(
            device_id = %self.device_id,
            method = %request.name,
            request_id = %request.request_id
        );
        self.runtime
            .spawn(async move { dispatcher.dispatch(request).await }.instrument(span));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::sample_reading;
    use crate::testing::mocks::MockTransport;
    use std::time::Duration;

    fn runner(capacity: usize) -> DeviceRunner<MockTransport> {
        let options = RunnerOptions {
            queue_capacity: capacity,
            backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(40)),
        };
        DeviceRunner::with_options(
            DeviceDescriptor::new("dev-1", "cs", 2),
            Arc::new(MockTransport::new()),
            options,
        )
    }

    #[test]
    fn test_try_enqueue_full_hands_back_reading() {
        let runner = runner(1);
        assert!(runner.try_enqueue(sample_reading(2)).is_ok());

        let rejected = runner.try_enqueue(serde_json::json!({"n": 2}));
        assert_eq!(
            rejected,
            Err(EnqueueError::Full(serde_json::json!({"n": 2})))
        );
        assert_eq!(runner.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_is_rejected() {
        let runner = runner(2);
        runner.stop();
        assert!(matches!(
            runner.enqueue(sample_reading(2)).await,
            Err(EnqueueError::Stopped(_))
        ));
        assert!(matches!(
            runner.try_enqueue(sample_reading(2)),
            Err(EnqueueError::Stopped(_))
        ));
    }

    #[tokio::test]
    async fn test_blocked_enqueue_released_by_stop() {
        let runner = Arc::new(runner(1));
        runner.enqueue(sample_reading(2)).await.unwrap();

        let producer = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.enqueue(sample_reading(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());

        runner.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("enqueue should unblock")
            .unwrap();
        assert!(matches!(result, Err(EnqueueError::Stopped(_))));
        assert_eq!(runner.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_connected_report_resets_backoff() {
        let runner = runner(1);
        let policy = runner.shared.policy;
        runner.shared.lock_backoff().record_failure(&policy);
        assert_eq!(runner.backoff_state().attempt(), 2);

        let events = RunnerEvents::<MockTransport> {
            device_id: "dev-1".to_string(),
            signals: runner.signals().clone(),
            backoff: Arc::clone(&runner.shared.backoff),
            on_message: None,
            dispatcher: None,
            runtime: Handle::current(),
        };
        events.on_connection_state_change(true);

        assert!(runner.signals().is_connected());
        assert_eq!(runner.backoff_state(), BackoffState::new());

        events.on_connection_state_change(false);
        assert!(runner.signals().is_disconnected());
    }

    #[tokio::test]
    async fn test_message_callback_receives_decoded_payload() {
        let runner = runner(1);
        let received = Arc::new(Mutex::new(Vec::new()));
        let callback: MessageCallback = {
            let received = Arc::clone(&received);
            Arc::new(move |device_id: &str, payload: InboundPayload| {
                received
                    .lock()
                    .unwrap()
                    .push((device_id.to_string(), payload));
            })
        };

        let events = RunnerEvents::<MockTransport> {
            device_id: runner.device_id().to_string(),
            signals: runner.signals().clone(),
            backoff: Arc::clone(&runner.shared.backoff),
            on_message: Some(callback),
            dispatcher: None,
            runtime: Handle::current(),
        };
        events.on_message(InboundMessage::new(br#"{"method":"run_hmi"}"#.to_vec()));
        events.on_message(InboundMessage::new(b"plain".to_vec()));

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0, "dev-1");
        assert!(received[0].1.as_json().is_some());
        assert_eq!(received[1].1, InboundPayload::Text("plain".to_string()));
    }
}
