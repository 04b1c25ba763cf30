//! Test helpers and utilities for integration tests

use fieldlink::backoff::BackoffPolicy;
use fieldlink::device::DeviceDescriptor;
use fieldlink::runner::{DeviceRunner, RunnerOptions};
use fieldlink::telemetry::sample_reading;
use fieldlink::testing::MockTransport;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_DEVICE_ID: &str = "pump-01";

/// Generous upper bound for anything that should happen "promptly"
#[allow(dead_code)]
pub const PROMPTLY: Duration = Duration::from_secs(2);

#[allow(dead_code)]
pub fn test_device() -> DeviceDescriptor {
    DeviceDescriptor::new(
        TEST_DEVICE_ID,
        "HostName=test-hub.azure-devices.net;DeviceId=pump-01;SharedAccessKey=dGVzdC1rZXk=",
        2,
    )
}

/// Runner with a fast backoff policy over a fresh mock transport
#[allow(dead_code)]
pub fn test_runner(
    initial_ms: u64,
    max_ms: u64,
) -> (Arc<DeviceRunner<MockTransport>>, Arc<MockTransport>) {
    test_runner_with_capacity(initial_ms, max_ms, 10)
}

#[allow(dead_code)]
pub fn test_runner_with_capacity(
    initial_ms: u64,
    max_ms: u64,
    queue_capacity: usize,
) -> (Arc<DeviceRunner<MockTransport>>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let options = RunnerOptions {
        queue_capacity,
        backoff: BackoffPolicy::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
        ),
    };
    let runner = Arc::new(DeviceRunner::with_options(
        test_device(),
        Arc::clone(&transport),
        options,
    ));
    (runner, transport)
}

/// A valid two-valve reading tagged through the `Bomba` field, which
/// survives payload building
#[allow(dead_code)]
pub fn tagged_reading(tag: u64) -> Value {
    let mut reading = sample_reading(2);
    reading["Bomba"] = json!({ "Falla_Presion": false, "tag": tag });
    reading
}

/// Tag of a sent telemetry body built from [`tagged_reading`]
#[allow(dead_code)]
pub fn tag_of(payload: &Value) -> Option<u64> {
    payload["Bomba"]["tag"].as_u64()
}
