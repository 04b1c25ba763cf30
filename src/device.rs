//! Device descriptor

use crate::telemetry::{self, PayloadError};
use serde_json::Value;

/// Static identity and shape of one field device
///
/// Configuration only: the connection itself is owned by the runner.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    device_id: String,
    connection_string: String,
    n_valves: u32,
}

impl std::fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The connection string embeds the shared access key
        f.debug_struct("DeviceDescriptor")
            .field("device_id", &self.device_id)
            .field("connection_string", &"***")
            .field("n_valves", &self.n_valves)
            .finish()
    }
}

impl DeviceDescriptor {
    pub fn new(
        device_id: impl Into<String>,
        connection_string: impl Into<String>,
        n_valves: u32,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            connection_string: connection_string.into(),
            n_valves,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn n_valves(&self) -> u32 {
        self.n_valves
    }

    /// Telemetry body for `raw`, keeping only this device's valves
    pub fn build_payload(&self, raw: &Value) -> Result<String, PayloadError> {
        telemetry::build_payload(raw, self.n_valves)
    }
}
