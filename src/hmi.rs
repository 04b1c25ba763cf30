//! HMI commands and their event log
//!
//! Operators drive the pump HMI either through cloud-to-device messages
//! (`{"method": "run_hmi", "user": "..."}`) or through direct methods of the
//! same names. Both paths end up as one entry in an [`EventStore`].

use crate::dispatch::{HandlerError, MethodOutcome, MethodRegistry};
use crate::runner::MessageCallback;
use crate::transport::{InboundPayload, MethodRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Default number of events returned by [`EventStore::events`] callers
pub const DEFAULT_EVENT_LIMIT: usize = 100;

/// User recorded when the command carries none
pub const UNKNOWN_USER: &str = "unknown";

/// Commands the HMI understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HmiCommand {
    RunHmi,
    StopHmi,
    ResetHmi,
}

impl HmiCommand {
    pub const ALL: [HmiCommand; 3] = [HmiCommand::RunHmi, HmiCommand::StopHmi, HmiCommand::ResetHmi];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "run_hmi" => Some(HmiCommand::RunHmi),
            "stop_hmi" => Some(HmiCommand::StopHmi),
            "reset_hmi" => Some(HmiCommand::ResetHmi),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HmiCommand::RunHmi => "run_hmi",
            HmiCommand::StopHmi => "stop_hmi",
            HmiCommand::ResetHmi => "reset_hmi",
        }
    }
}

impl fmt::Display for HmiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded HMI command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmiEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub user: String,
    pub payload: Value,
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("Event store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Event store lock poisoned")]
    Poisoned,
}

/// Persistent log of HMI commands
pub trait EventStore: Send + Sync {
    /// Record `method` with its payload; a `user` key is moved out of the
    /// payload into the event
    fn log_event(&self, method: HmiCommand, payload: Value) -> Result<HmiEvent, EventStoreError>;

    /// Recorded events, newest first, optionally only those for `method`
    fn events(&self, method: Option<&str>, limit: usize) -> Result<Vec<HmiEvent>, EventStoreError>;
}

/// Split the `user` key off a command payload
fn take_user(payload: Value) -> (String, Value) {
    match payload {
        Value::Object(mut map) => {
            let user = match map.remove("user") {
                Some(Value::String(user)) => user,
                Some(Value::Null) | None => UNKNOWN_USER.to_string(),
                Some(other) => other.to_string(),
            };
            (user, Value::Object(map))
        }
        other => (UNKNOWN_USER.to_string(), other),
    }
}

/// Append-only JSON-lines event store
pub struct JsonlEventStore {
    path: PathBuf,
    next_id: Mutex<u64>,
}

impl fmt::Debug for JsonlEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlEventStore")
            .field("path", &self.path)
            .finish()
    }
}

impl JsonlEventStore {
    /// Open (creating parent directories and the file) and resume id
    /// numbering after the last stored event
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EventStoreError> {
        let path = path.into();
        let io_error = |source| EventStoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;

        let last_id = Self::read_all(&path)?
            .iter()
            .map(|event| event.id)
            .max()
            .unwrap_or(0);

        info!(path = %path.display(), last_id, "HMI event store opened");
        Ok(Self {
            path,
            next_id: Mutex::new(last_id + 1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(path: &Path) -> Result<Vec<HmiEvent>, EventStoreError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(EventStoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut events = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| EventStoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HmiEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping unreadable HMI event"
                ),
            }
        }
        Ok(events)
    }
}

impl EventStore for JsonlEventStore {
    fn log_event(&self, method: HmiCommand, payload: Value) -> Result<HmiEvent, EventStoreError> {
        let (user, payload) = take_user(payload);

        // Held across the write so ids land in file order
        let mut next_id = self.next_id.lock().map_err(|_| EventStoreError::Poisoned)?;
        let event = HmiEvent {
            id: *next_id,
            timestamp: Utc::now(),
            method: method.as_str().to_string(),
            user,
            payload,
        };

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let io_error = |source| EventStoreError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_error)?;
        file.write_all(line.as_bytes()).map_err(io_error)?;

        *next_id += 1;
        debug!(id = event.id, method = %event.method, user = %event.user, "HMI event logged");
        Ok(event)
    }

    fn events(&self, method: Option<&str>, limit: usize) -> Result<Vec<HmiEvent>, EventStoreError> {
        let events = Self::read_all(&self.path)?;
        Ok(events
            .into_iter()
            .rev()
            .filter(|event| method.map_or(true, |m| event.method == m))
            .take(limit)
            .collect())
    }
}

/// Handle a cloud-to-device HMI message
///
/// The payload must be a JSON object carrying `method` and `user`. Anything
/// else is logged and dropped; the `method` key is not stored. Returns the
/// recorded event, if any.
pub fn dispatch_c2d(
    store: &dyn EventStore,
    device_id: &str,
    payload: &InboundPayload,
) -> Option<HmiEvent> {
    let Some(Value::Object(message)) = payload.as_json() else {
        warn!(device_id, payload = ?payload, "Ignoring non-object HMI message");
        return None;
    };

    let Some(method) = message.get("method") else {
        warn!(device_id, "HMI message has no 'method' key");
        return None;
    };
    if message.get("user").filter(|user| !user.is_null()).is_none() {
        warn!(device_id, "HMI message has no 'user' key");
        return None;
    }
    let Some(command) = method.as_str().and_then(HmiCommand::parse) else {
        warn!(device_id, method = %method, "Unknown HMI method");
        return None;
    };

    let mut body: Map<String, Value> = message.clone();
    body.remove("method");

    info!(device_id, method = %command, "Dispatching HMI command");
    match store.log_event(command, Value::Object(body)) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(device_id, method = %command, error = %e, "Failed to record HMI event");
            None
        }
    }
}

/// C2D callback feeding [`dispatch_c2d`]
///
/// The store writes to disk, so recording runs on the blocking pool instead
/// of the transport's event task.
pub fn message_callback(store: Arc<dyn EventStore>) -> MessageCallback {
    Arc::new(move |device_id: &str, payload: InboundPayload| {
        let store = Arc::clone(&store);
        let device_id = device_id.to_string();
        let record = move || {
            dispatch_c2d(store.as_ref(), &device_id, &payload);
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(record);
            }
            Err(_) => record(),
        }
    })
}

/// Payloads that carry nothing (`null`, `false`, `0`, `""`, `[]`, `{}`)
/// are stored as `{}`
fn or_empty_object(payload: Value) -> Value {
    let empty = match &payload {
        Value::Null | Value::Bool(false) => true,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(true) => false,
    };
    if empty {
        json!({})
    } else {
        payload
    }
}

/// Direct methods `run_hmi`, `stop_hmi` and `reset_hmi`, each recording its
/// payload and answering `200 {"result": true}`
pub fn build_method_registry(store: Arc<dyn EventStore>) -> MethodRegistry {
    HmiCommand::ALL
        .iter()
        .fold(MethodRegistry::new(), |registry, &command| {
            let store = Arc::clone(&store);
            registry.register(command.as_str(), move |request: MethodRequest| {
                let store = Arc::clone(&store);
                async move {
                    let payload = or_empty_object(request.payload);
                    tokio::task::spawn_blocking(move || store.log_event(command, payload))
                        .await
                        .map_err(|e| -> HandlerError { Box::new(e) })?
                        .map_err(|e| -> HandlerError { Box::new(e) })?;
                    Ok::<_, HandlerError>(MethodOutcome::ok(json!({"result": true})))
                }
            })
        })
}
