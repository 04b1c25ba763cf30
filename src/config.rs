//! Fleet configuration
//!
//! Loaded from a TOML file, or from the flat `DEVICE_*` / `INFRA_*`
//! environment variables when no file is present. Connection strings carry
//! the device key, so the file only names the environment variable that
//! holds each one.

use crate::backoff::BackoffPolicy;
use crate::device::DeviceDescriptor;
use crate::runner::RunnerOptions;
use crate::transport::mqtt::TransportSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Files tried, in order, when no config path is given
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["fieldlink.toml", "config/fieldlink.toml"];

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetConfig {
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// Runner section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerSection {
    /// Bound of each device's outbound queue
    pub queue_capacity: usize,
    /// Delay after the first failed connect
    pub initial_retry_secs: u64,
    /// Backoff ceiling; reaching it stops the runner
    pub max_retry_secs: u64,
    /// Route C2D messages and direct methods to the HMI handlers
    pub receive_data: bool,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            queue_capacity: crate::runner::DEFAULT_QUEUE_CAPACITY,
            initial_retry_secs: 2,
            max_retry_secs: 7200,
            receive_data: true,
        }
    }
}

/// IoT Hub transport section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportSection {
    pub api_version: String,
    pub sas_ttl_secs: u64,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        let defaults = TransportSettings::default();
        Self {
            api_version: defaults.api_version,
            sas_ttl_secs: defaults.sas_ttl.as_secs(),
            keep_alive_secs: defaults.keep_alive.as_secs(),
            connect_timeout_secs: defaults.operation_timeout.as_secs(),
        }
    }
}

/// HMI event log section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsSection {
    pub path: PathBuf,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/hmi_events.jsonl"),
        }
    }
}

/// One `[[devices]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEntry {
    /// IoT Hub device id (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Environment variable containing the device connection string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string_env: Option<String>,
    /// Inline connection string (set by `from_env`; avoid in files)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    /// Number of valves reported in telemetry
    pub n_valves: u32,
}

impl DeviceEntry {
    /// Resolve the connection string, environment variable first
    pub fn resolve_connection_string(&self) -> Result<String, ConfigError> {
        if let Some(env_name) = &self.connection_string_env {
            return std::env::var(env_name)
                .map_err(|_| ConfigError::EnvVarNotFound(env_name.clone()));
        }
        self.connection_string.clone().ok_or_else(|| {
            ConfigError::InvalidConfig(format!(
                "device '{}' has neither connection_string_env nor connection_string",
                self.id
            ))
        })
    }

    pub fn descriptor(&self) -> Result<DeviceDescriptor, ConfigError> {
        Ok(DeviceDescriptor::new(
            self.id.clone(),
            self.resolve_connection_string()?,
            self.n_valves,
        ))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid environment variable {name}: {reason}")]
    InvalidEnvVar { name: String, reason: String },
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FleetConfig {
    /// Load and validate a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the first default file that exists,
    /// else the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }
        match DEFAULT_CONFIG_PATHS
            .iter()
            .map(Path::new)
            .find(|candidate| candidate.exists())
        {
            Some(found) => Self::load_from_file(found),
            None => Self::from_env(),
        }
    }

    /// Build from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Build from `DEVICE_CONNECTION_STRINGS`, `DEVICE_IDS`,
    /// `DEVICE_N_VALVES` (comma-separated, same length), `DEVICE_RECEIVE_DATA`
    /// and `INFRA_DB_PATH`, read through `lookup`
    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let list = |name: &str| -> Vec<String> {
            lookup(name)
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let connection_strings = list("DEVICE_CONNECTION_STRINGS");
        let ids = list("DEVICE_IDS");
        let n_valves = list("DEVICE_N_VALVES")
            .iter()
            .map(|raw| {
                raw.parse::<u32>().map_err(|e| ConfigError::InvalidEnvVar {
                    name: "DEVICE_N_VALVES".to_string(),
                    reason: format!("'{raw}': {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if connection_strings.len() != ids.len() || ids.len() != n_valves.len() {
            return Err(ConfigError::InvalidConfig(format!(
                "DEVICE_CONNECTION_STRINGS, DEVICE_IDS and DEVICE_N_VALVES must have the same \
                 number of entries, got {}, {} and {}",
                connection_strings.len(),
                ids.len(),
                n_valves.len()
            )));
        }

        let mut config = FleetConfig {
            runner: RunnerSection::default(),
            transport: TransportSection::default(),
            events: EventsSection::default(),
            devices: ids
                .into_iter()
                .zip(connection_strings)
                .zip(n_valves)
                .map(|((id, connection_string), n_valves)| DeviceEntry {
                    id,
                    connection_string_env: None,
                    connection_string: Some(connection_string),
                    n_valves,
                })
                .collect(),
        };

        if let Some(raw) = lookup("DEVICE_RECEIVE_DATA") {
            config.runner.receive_data =
                matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(path) = lookup("INFRA_DB_PATH").filter(|p| !p.trim().is_empty()) {
            config.events.path = PathBuf::from(path);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every value the runner relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "no devices configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            validate_device_id(&device.id)?;
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "device '{}' is configured more than once",
                    device.id
                )));
            }
            if device.n_valves == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "device '{}' must have at least one valve",
                    device.id
                )));
            }
            if device.connection_string_env.is_none() && device.connection_string.is_none() {
                return Err(ConfigError::InvalidConfig(format!(
                    "device '{}' needs connection_string_env",
                    device.id
                )));
            }
        }

        if self.runner.queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "runner.queue_capacity must be at least 1".to_string(),
            ));
        }
        self.backoff_policy()
            .validate()
            .map_err(|reason| ConfigError::InvalidConfig(format!("runner: {reason}")))?;

        if self.transport.api_version.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "transport.api_version must not be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("sas_ttl_secs", self.transport.sas_ttl_secs),
            ("keep_alive_secs", self.transport.keep_alive_secs),
            ("connect_timeout_secs", self.transport.connect_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "transport.{name} must be greater than 0"
                )));
            }
        }

        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.runner.initial_retry_secs),
            Duration::from_secs(self.runner.max_retry_secs),
        )
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            queue_capacity: self.runner.queue_capacity,
            backoff: self.backoff_policy(),
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            api_version: self.transport.api_version.clone(),
            sas_ttl: Duration::from_secs(self.transport.sas_ttl_secs),
            keep_alive: Duration::from_secs(self.transport.keep_alive_secs),
            operation_timeout: Duration::from_secs(self.transport.connect_timeout_secs),
        }
    }

    /// Copy safe to print: inline connection strings are masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for device in &mut copy.devices {
            if device.connection_string.is_some() {
                device.connection_string = Some("***".to_string());
            }
        }
        copy
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[[devices]]
id = "pump-01"
connection_string_env = "PUMP_01_CONNECTION_STRING"
n_valves = 4
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate device ID format
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[runner]
queue_capacity = 50
initial_retry_secs = 1
max_retry_secs = 600
receive_data = false

[transport]
api_version = "2020-09-30"
sas_ttl_secs = 900
keep_alive_secs = 30
connect_timeout_secs = 10

[events]
path = "/var/lib/fieldlink/events.jsonl"

[[devices]]
id = "pump-01"
connection_string_env = "PUMP_01_CS"
n_valves = 4

[[devices]]
id = "pump-02"
connection_string_env = "PUMP_02_CS"
n_valves = 2
"#;

        let config = FleetConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.runner.queue_capacity, 50);
        assert!(!config.runner.receive_data);
        assert_eq!(config.transport.api_version, "2020-09-30");
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[1].n_valves, 2);

        let options = config.runner_options();
        assert_eq!(options.queue_capacity, 50);
        assert_eq!(options.backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(
            config.transport_settings().operation_timeout,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = FleetConfig::test_config();
        config.validate().unwrap();

        assert_eq!(config.runner.queue_capacity, 100);
        assert_eq!(config.runner.initial_retry_secs, 2);
        assert_eq!(config.runner.max_retry_secs, 7200);
        assert!(config.runner.receive_data);
        assert_eq!(config.transport.api_version, "2021-04-12");
        assert_eq!(config.transport.sas_ttl_secs, 3600);
        assert_eq!(config.events.path, PathBuf::from("data/hmi_events.jsonl"));
    }

    #[test]
    fn test_invalid_device_id() {
        assert!(validate_device_id("pump@01").is_err());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("pump-01_a.b").is_ok());
    }

    #[test]
    fn test_rejects_duplicate_devices() {
        let mut config = FleetConfig::test_config();
        config.devices.push(config.devices[0].clone());
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("more than once"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = FleetConfig::test_config();
        config.devices[0].n_valves = 0;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::test_config();
        config.runner.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::test_config();
        config.runner.max_retry_secs = config.runner.initial_retry_secs;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::test_config();
        config.transport.keep_alive_secs = 0;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::test_config();
        config.devices.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_env() {
        let lookup = env(&[
            (
                "DEVICE_CONNECTION_STRINGS",
                "HostName=h;DeviceId=a;SharedAccessKey=k1=, HostName=h;DeviceId=b;SharedAccessKey=k2=",
            ),
            ("DEVICE_IDS", "a,b"),
            ("DEVICE_N_VALVES", "4, 2"),
            ("DEVICE_RECEIVE_DATA", "no"),
            ("INFRA_DB_PATH", "/tmp/events.jsonl"),
        ]);

        let config = FleetConfig::from_env_with(lookup).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[1].id, "b");
        assert_eq!(config.devices[1].n_valves, 2);
        assert_eq!(
            config.devices[0].resolve_connection_string().unwrap(),
            "HostName=h;DeviceId=a;SharedAccessKey=k1="
        );
        assert!(!config.runner.receive_data);
        assert_eq!(config.events.path, PathBuf::from("/tmp/events.jsonl"));
    }

    #[test]
    fn test_from_env_length_mismatch() {
        let lookup = env(&[
            ("DEVICE_CONNECTION_STRINGS", "cs1"),
            ("DEVICE_IDS", "a,b"),
            ("DEVICE_N_VALVES", "4,2"),
        ]);
        let error = FleetConfig::from_env_with(lookup).unwrap_err();
        assert!(error.to_string().contains("same number of entries"));
    }

    #[test]
    fn test_from_env_bad_valve_count() {
        let lookup = env(&[
            ("DEVICE_CONNECTION_STRINGS", "cs1"),
            ("DEVICE_IDS", "a"),
            ("DEVICE_N_VALVES", "four"),
        ]);
        assert!(matches!(
            FleetConfig::from_env_with(lookup),
            Err(ConfigError::InvalidEnvVar { .. })
        ));
    }

    #[test]
    fn test_from_env_empty_has_no_devices() {
        assert!(FleetConfig::from_env_with(env(&[])).is_err());
    }

    #[test]
    fn test_redacted_masks_inline_strings() {
        let lookup = env(&[
            ("DEVICE_CONNECTION_STRINGS", "HostName=h;DeviceId=a;SharedAccessKey=secret"),
            ("DEVICE_IDS", "a"),
            ("DEVICE_N_VALVES", "1"),
        ]);
        let config = FleetConfig::from_env_with(lookup).unwrap();
        let rendered = config.redacted().to_toml_string().unwrap();
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("id = \"a\""));
    }

    #[test]
    fn test_missing_env_var_reported() {
        let entry = DeviceEntry {
            id: "pump-01".to_string(),
            connection_string_env: Some("FIELDLINK_TEST_UNSET_VARIABLE_7F3A".to_string()),
            connection_string: None,
            n_valves: 1,
        };
        assert!(matches!(
            entry.descriptor(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "FIELDLINK_TEST_UNSET_VARIABLE_7F3A"
        ));
    }
}
