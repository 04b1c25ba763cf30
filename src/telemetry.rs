//! Telemetry body builder
//!
//! Turns a raw controller reading into the JSON document sent to IoT Hub.
//! Only the first `n_valves` valves are kept, so each device reports its
//! own valves even when the controller exposes more.

use serde_json::{json, Map, Value};
use thiserror::Error;

/// Top-level keys every reading must carry
pub const REQUIRED_KEYS: [&str; 3] = ["Alarma_Bajo_Nivel", "Bomba", "Estado_Equipo"];

/// Fields every valve entry must carry
pub const REQUIRED_VALVE_FIELDS: [&str; 6] = [
    "Estado",
    "Grasa_24h",
    "Grasa_Dispensada_Desde_Ultimo_Relleno",
    "Grasa_Ultimo_Ciclo",
    "Longitud_Pulsos_Ultimo_Ciclo",
    "Pulsos_Ultimo_Ciclo",
];

/// A reading that can never become a telemetry body
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("reading must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("reading is missing required top-level key(s): {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("reading is missing valve key '{key}' (expected {expected} valves)")]
    MissingValve { key: String, expected: u32 },

    #[error("valve '{valve}' is missing field(s): {}", .fields.join(", "))]
    MissingValveFields { valve: String, fields: Vec<String> },

    #[error("failed to serialize telemetry: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key of the i-th valve (1-based)
pub fn valve_key(index: u32) -> String {
    format!("Valvula_V{index}")
}

/// Build the telemetry JSON for a reading from a device with `n_valves` valves
pub fn build_payload(raw: &Value, n_valves: u32) -> Result<String, PayloadError> {
    let reading = raw
        .as_object()
        .ok_or_else(|| PayloadError::NotAnObject(json_kind(raw)))?;

    let missing = missing_keys(reading, &REQUIRED_KEYS);
    if !missing.is_empty() {
        return Err(PayloadError::MissingKeys(missing));
    }

    let mut payload = Map::new();
    for key in REQUIRED_KEYS {
        payload.insert(key.to_string(), reading[key].clone());
    }

    for index in 1..=n_valves {
        let key = valve_key(index);
        let valve = match reading.get(&key) {
            Some(Value::Object(valve)) => valve,
            Some(_) => {
                return Err(PayloadError::MissingValveFields {
                    valve: key,
                    fields: REQUIRED_VALVE_FIELDS.iter().map(|f| f.to_string()).collect(),
                })
            }
            None => {
                return Err(PayloadError::MissingValve {
                    key,
                    expected: n_valves,
                })
            }
        };

        let missing = missing_keys(valve, &REQUIRED_VALVE_FIELDS);
        if !missing.is_empty() {
            return Err(PayloadError::MissingValveFields {
                valve: key,
                fields: missing,
            });
        }

        let fields: Map<String, Value> = REQUIRED_VALVE_FIELDS
            .iter()
            .map(|field| (field.to_string(), valve[*field].clone()))
            .collect();
        payload.insert(key, Value::Object(fields));
    }

    Ok(serde_json::to_string(&Value::Object(payload))?)
}

/// Demo reading with `n_valves` valves, used by the sample producer
pub fn sample_reading(n_valves: u32) -> Value {
    const VALVES: [(f64, f64, f64, u64); 4] = [
        (79.95, 2202.85, 5.2, 8),
        (20.15, 583.05, 1.3, 2),
        (82.55, 2262.65, 5.2, 8),
        (21.45, 651.3, 1.3, 2),
    ];

    let mut reading = Map::new();
    reading.insert(
        "Alarma_Bajo_Nivel".to_string(),
        json!({"Estado": true, "Grasa_Dispensada_Desde_Ultimo_Relleno": 5699.85}),
    );
    reading.insert("Bomba".to_string(), json!({"Falla_Presion": true}));
    reading.insert("Estado_Equipo".to_string(), json!(true));

    for index in 1..=n_valves {
        let (grasa_24h, since_refill, last_cycle, pulse_len) =
            VALVES[(index as usize - 1) % VALVES.len()];
        reading.insert(
            valve_key(index),
            json!({
                "Estado": true,
                "Grasa_24h": grasa_24h,
                "Grasa_Dispensada_Desde_Ultimo_Relleno": since_refill,
                "Grasa_Ultimo_Ciclo": last_cycle,
                "Longitud_Pulsos_Ultimo_Ciclo": pulse_len,
                "Pulsos_Ultimo_Ciclo": [947657322u64],
            }),
        );
    }

    Value::Object(reading)
}

fn missing_keys(object: &Map<String, Value>, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|key| !object.contains_key(**key))
        .map(|key| key.to_string())
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
