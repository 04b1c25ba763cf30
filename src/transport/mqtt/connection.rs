//! Pure connection setup for the IoT Hub MQTT client
//!
//! Connection-string parsing, shared access signatures, `rumqttc` option
//! construction and topic naming. Nothing in here touches the network.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use sha2::Sha256;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::form_urlencoded;

/// IoT Hub MQTT port (MQTT over TLS)
pub const IOTHUB_MQTT_PORT: u16 = 8883;

/// Service API version sent in the MQTT username
pub const DEFAULT_API_VERSION: &str = "2021-04-12";

/// Largest message IoT Hub accepts
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// IoT Hub MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid credentials: {0}")]
    Credentials(#[from] ConnectionStringError),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection refused by IoT Hub: {0}")]
    ConnectionRefused(String),
    #[error("No ConnAck within {0:?}")]
    ConnAckTimeout(Duration),
    #[error("Not connected")]
    NotConnected,
    #[error("Publishing failed")]
    PublishFailed(#[source] rumqttc::ClientError),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] rumqttc::ClientError),
    #[error("Connection lost before the publish was acknowledged")]
    LinkLost,
    #[error("Publish not acknowledged within {0:?}")]
    AckTimeout(Duration),
    #[error("Serialization error")]
    Serialization(#[from] serde_json::Error),
}

/// Problems with a device connection string or its key
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionStringError {
    #[error("connection string is missing '{0}'")]
    MissingField(&'static str),
    #[error("malformed connection string segment '{0}'")]
    MalformedSegment(String),
    #[error("shared access key is not valid base64")]
    InvalidKey,
}

/// Parsed IoT Hub device (or module) connection string
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub shared_access_key: String,
    pub shared_access_key_name: Option<String>,
    pub module_id: Option<String>,
    pub gateway_host_name: Option<String>,
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("shared_access_key", &"***")
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("module_id", &self.module_id)
            .field("gateway_host_name", &self.gateway_host_name)
            .finish()
    }
}

impl ConnectionString {
    /// Parse `HostName=..;DeviceId=..;SharedAccessKey=..` (order free)
    pub fn parse(input: &str) -> Result<Self, ConnectionStringError> {
        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;
        let mut shared_access_key_name = None;
        let mut module_id = None;
        let mut gateway_host_name = None;

        for segment in input.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            // Keys are base64 and may end in '=', so split on the first one only
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::MalformedSegment(redact(segment)))?;
            let value = Some(value.to_string());
            match key {
                "HostName" => host_name = value,
                "DeviceId" => device_id = value,
                "SharedAccessKey" => shared_access_key = value,
                "SharedAccessKeyName" => shared_access_key_name = value,
                "ModuleId" => module_id = value,
                "GatewayHostName" => gateway_host_name = value,
                _ => {}
            }
        }

        let non_empty = |value: Option<String>, field| {
            value
                .filter(|v| !v.is_empty())
                .ok_or(ConnectionStringError::MissingField(field))
        };

        Ok(Self {
            host_name: non_empty(host_name, "HostName")?,
            device_id: non_empty(device_id, "DeviceId")?,
            shared_access_key: non_empty(shared_access_key, "SharedAccessKey")?,
            shared_access_key_name,
            module_id,
            gateway_host_name,
        })
    }

    /// Host the MQTT connection goes to (gateway when one is configured)
    pub fn broker_host(&self) -> &str {
        self.gateway_host_name.as_deref().unwrap_or(&self.host_name)
    }

    /// MQTT client id: `device` or `device/module`
    pub fn client_id(&self) -> String {
        match &self.module_id {
            Some(module) => format!("{}/{}", self.device_id, module),
            None => self.device_id.clone(),
        }
    }

    /// Resource URI the SAS token is scoped to
    pub fn resource_uri(&self) -> String {
        match &self.module_id {
            Some(module) => format!("{}/devices/{}/modules/{}", self.host_name, self.device_id, module),
            None => format!("{}/devices/{}", self.host_name, self.device_id),
        }
    }

    /// MQTT username: `{hub}/{client id}/?api-version={v}`
    pub fn username(&self, api_version: &str) -> String {
        format!("{}/{}/?api-version={}", self.host_name, self.client_id(), api_version)
    }

    /// SAS token valid until `expiry` (seconds since the Unix epoch)
    pub fn sas_token(&self, expiry: u64) -> Result<String, ConnectionStringError> {
        generate_sas_token(
            &self.resource_uri(),
            &self.shared_access_key,
            self.shared_access_key_name.as_deref(),
            expiry,
        )
    }
}

fn redact(segment: &str) -> String {
    let head: String = segment.chars().take(8).collect();
    if head.len() < segment.len() {
        format!("{head}...")
    } else {
        head
    }
}

fn url_encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Shared access signature for `resource_uri`.
///
/// HMAC-SHA256 over `"{url-encoded resource}\n{expiry}"`, keyed with the
/// base64-decoded shared access key.
pub fn generate_sas_token(
    resource_uri: &str,
    key: &str,
    key_name: Option<&str>,
    expiry: u64,
) -> Result<String, ConnectionStringError> {
    let key = STANDARD
        .decode(key)
        .map_err(|_| ConnectionStringError::InvalidKey)?;
    let encoded_resource = url_encode(resource_uri);
    let to_sign = format!("{encoded_resource}\n{expiry}");

    let mut mac =
        Hmac::<Sha256>::new_from_slice(&key).map_err(|_| ConnectionStringError::InvalidKey)?;
    mac.update(to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={encoded_resource}&sig={}&se={expiry}",
        url_encode(&signature)
    );
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(&url_encode(name));
    }
    Ok(token)
}

/// Per-connection settings of the IoT Hub client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub api_version: String,
    /// Lifetime of the SAS token minted for each connection
    pub sas_ttl: Duration,
    pub keep_alive: Duration,
    /// Bound on waiting for ConnAck and for each PubAck
    pub operation_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            sas_ttl: Duration::from_secs(3600),
            keep_alive: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// Build `rumqttc` options for one connection attempt.
///
/// A fresh SAS token expiring `sas_ttl` after `now_unix` is minted each time.
pub fn configure_mqtt_options(
    connection: &ConnectionString,
    settings: &TransportSettings,
    now_unix: u64,
) -> Result<MqttOptions, MqttError> {
    let expiry = now_unix + settings.sas_ttl.as_secs();
    let password = connection.sas_token(expiry)?;

    let mut options = MqttOptions::new(
        connection.client_id(),
        connection.broker_host(),
        IOTHUB_MQTT_PORT,
    );
    options.set_credentials(connection.username(&settings.api_version), password);
    options.set_transport(RumqttcTransport::tls_with_default_config());
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    Ok(options)
}

/// IoT Hub topic names for one device (or module)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    device_id: String,
    module_id: Option<String>,
}

impl TopicBuilder {
    /// Direct-method requests arrive under this prefix
    pub const METHODS_PREFIX: &'static str = "$iothub/methods/POST/";

    pub fn new(device_id: impl Into<String>, module_id: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            module_id,
        }
    }

    pub fn for_connection(connection: &ConnectionString) -> Self {
        Self::new(connection.device_id.clone(), connection.module_id.clone())
    }

    fn identity_path(&self) -> String {
        match &self.module_id {
            Some(module) => format!("devices/{}/modules/{}", self.device_id, module),
            None => format!("devices/{}", self.device_id),
        }
    }

    /// Telemetry topic with the content type and encoding in the property bag
    pub fn telemetry(&self, content_type: &str, content_encoding: &str) -> String {
        format!(
            "{}/messages/events/$.ct={}&$.ce={}",
            self.identity_path(),
            url_encode(content_type),
            url_encode(content_encoding)
        )
    }

    /// Prefix of every cloud-to-device topic
    pub fn c2d_prefix(&self) -> String {
        format!("devices/{}/messages/devicebound/", self.device_id)
    }

    /// Cloud-to-device subscription; modules have none
    pub fn c2d_filter(&self) -> Option<String> {
        match self.module_id {
            Some(_) => None,
            None => Some(format!("{}#", self.c2d_prefix())),
        }
    }

    pub fn methods_filter(&self) -> String {
        format!("{}#", Self::METHODS_PREFIX)
    }

    /// Every filter to subscribe after connecting
    pub fn subscriptions(&self) -> Vec<String> {
        self.c2d_filter()
            .into_iter()
            .chain(std::iter::once(self.methods_filter()))
            .collect()
    }

    /// Topic for a direct-method response
    pub fn method_response(status: u16, request_id: &str) -> String {
        format!("$iothub/methods/res/{status}/?$rid={}", url_encode(request_id))
    }
}
