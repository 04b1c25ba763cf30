//! fieldlink - resilient Azure IoT Hub connectivity for field devices
//!
//! Each device gets a [`DeviceRunner`] that keeps it connected: it
//! reconnects with exponential backoff, drains a bounded queue of telemetry
//! readings while the link is up, and answers direct methods through a
//! [`MethodRegistry`]. A fleet of runners is supervised by
//! [`fleet::run_fleet`].
//!
//! # Quick Start
//!
//! ```rust
//! use fieldlink::testing::MockTransport;
//! use fieldlink::telemetry::sample_reading;
//! use fieldlink::{DeviceDescriptor, DeviceRunner};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let device = DeviceDescriptor::new("pump-01", "HostName=hub;DeviceId=pump-01;SharedAccessKey=a2V5", 2);
//! let runner = DeviceRunner::new(device, Arc::new(MockTransport::new()));
//!
//! runner.enqueue(sample_reading(2)).await.unwrap();
//! assert_eq!(runner.pending_len(), 1);
//! # });
//! ```

pub mod backoff;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod fleet;
pub mod hmi;
pub mod observability;
pub mod queue;
pub mod runner;
pub mod signal;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use backoff::{BackoffDecision, BackoffPolicy, BackoffState};
pub use config::{ConfigError, FleetConfig};
pub use device::DeviceDescriptor;
pub use dispatch::{MethodHandler, MethodOutcome, MethodRegistry};
pub use error::{EnqueueError, RunnerError, RunnerResult};
pub use runner::{DeviceRunner, MessageCallback, RunnerOptions};
pub use signal::{ConnectionSignals, LinkState, Signal};
pub use transport::{InboundPayload, MethodRequest, MethodResponse, Transport, TransportEvents};
