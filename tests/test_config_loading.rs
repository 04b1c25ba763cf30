//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use fieldlink::config::{ConfigError, FleetConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[runner]
queue_capacity = 20
initial_retry_secs = 5

[[devices]]
id = "pump-01"
connection_string_env = "PUMP_01_CONNECTION_STRING"
n_valves = 4

[[devices]]
id = "pump-02"
connection_string_env = "PUMP_02_CONNECTION_STRING"
n_valves = 1
"#,
    );

    let config = FleetConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(config.devices.len(), 2);
    assert_eq!(config.devices[0].id, "pump-01");
    assert_eq!(config.runner.queue_capacity, 20);

    let policy = config.backoff_policy();
    assert_eq!(policy.initial_delay, Duration::from_secs(5));
    assert_eq!(policy.max_delay, Duration::from_secs(7200));
}

#[test]
fn test_explicit_path_takes_precedence() {
    let temp_file = write_config(
        r#"
[[devices]]
id = "explicit"
connection_string_env = "EXPLICIT_CS"
n_valves = 2
"#,
    );
    let config = FleetConfig::load(Some(temp_file.path())).unwrap();
    assert_eq!(config.devices[0].id, "explicit");
}

#[test]
fn test_missing_file_is_read_error() {
    let result = FleetConfig::load_from_file(std::path::Path::new("/nonexistent/fieldlink.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let temp_file = write_config("[[devices]\nid = ");
    let result = FleetConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_device_without_valves_field_rejected() {
    let temp_file = write_config(
        r#"
[[devices]]
id = "pump-01"
connection_string_env = "PUMP_01_CONNECTION_STRING"
"#,
    );
    assert!(matches!(
        FleetConfig::load_from_file(temp_file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_invalid_device_id_rejected() {
    let temp_file = write_config(
        r#"
[[devices]]
id = "pump 01"
connection_string_env = "PUMP_01_CONNECTION_STRING"
n_valves = 1
"#,
    );
    assert!(matches!(
        FleetConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidDeviceId(_))
    ));
}

#[test]
fn test_inverted_backoff_bounds_rejected() {
    let temp_file = write_config(
        r#"
[runner]
initial_retry_secs = 60
max_retry_secs = 30

[[devices]]
id = "pump-01"
connection_string_env = "PUMP_01_CONNECTION_STRING"
n_valves = 1
"#,
    );
    let error = FleetConfig::load_from_file(temp_file.path()).unwrap_err();
    assert!(matches!(error, ConfigError::InvalidConfig(_)));
    assert!(error.to_string().contains("max retry delay"));
}

#[test]
fn test_connection_string_resolved_from_named_variable() {
    let variable = "FIELDLINK_IT_CONNECTION_STRING_5C1E";
    std::env::set_var(
        variable,
        "HostName=hub.azure-devices.net;DeviceId=pump-01;SharedAccessKey=a2V5",
    );
    let temp_file = write_config(&format!(
        r#"
[[devices]]
id = "pump-01"
connection_string_env = "{variable}"
n_valves = 3
"#
    ));

    let config = FleetConfig::load_from_file(temp_file.path()).unwrap();
    let descriptor = config.devices[0].descriptor().unwrap();
    assert_eq!(descriptor.device_id(), "pump-01");
    assert_eq!(descriptor.n_valves(), 3);
    assert!(descriptor.connection_string().contains("SharedAccessKey=a2V5"));
    assert!(!format!("{descriptor:?}").contains("a2V5"));

    std::env::remove_var(variable);
}

#[test]
fn test_show_output_round_trips_through_toml() {
    let temp_file = write_config(
        r#"
[transport]
keep_alive_secs = 120

[[devices]]
id = "pump-01"
connection_string_env = "PUMP_01_CONNECTION_STRING"
n_valves = 2
"#,
    );
    let config = FleetConfig::load_from_file(temp_file.path()).unwrap();
    let rendered = config.redacted().to_toml_string().unwrap();
    let reparsed = FleetConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
    assert_eq!(
        reparsed.transport_settings().keep_alive,
        Duration::from_secs(120)
    );
}
