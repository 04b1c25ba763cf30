//! Azure IoT Hub transport over MQTT 3.1.1
//!
//! Split the same way as the rest of the transport layer: pure functions
//! apart from I/O.
//!
//! - [`connection`] - connection strings, SAS tokens, options and topics
//! - [`message_handler`] - classification of broker events
//! - [`client`] - the [`IotHubClient`] itself
//!
//! ```rust,no_run
//! use fieldlink::transport::mqtt::{IotHubClient, TransportSettings};
//! use fieldlink::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let client = IotHubClient::from_connection_string(
//!     "HostName=hub.azure-devices.net;DeviceId=pump-01;SharedAccessKey=...",
//!     TransportSettings::default(),
//! )?;
//! client.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::IotHubClient;
pub use connection::{
    configure_mqtt_options, generate_sas_token, ConnectionString, ConnectionStringError,
    MqttError, TopicBuilder, TransportSettings,
};
pub use message_handler::{EventRoute, MessageHandler};
