use chrono::{DateTime, Local, TimeZone};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// A message received from the broker, payload decoded as UTF-8 text.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub text: String,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn from_topic(topic: impl Into<String>, payload: &[u8]) -> Self {
        InboundMessage {
            topic: topic.into(),
            text: String::from_utf8_lossy(payload).into_owned(),
            received_at: Local::now(),
        }
    }

    /// Parses the payload as a JSON object.
    pub fn json_object(&self) -> Result<Map<String, Value>, PayloadError> {
        match serde_json::from_str::<Value>(&self.text)? {
            Value::Object(map) => Ok(map),
            _ => Err(PayloadError::NotAnObject),
        }
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.text.chars().take(40).collect();
        write!(f, "{} - {}: {}", self.received_at.format("%H:%M:%S"), self.topic, preview)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,
}

/// Command envelope published on the device's command topic.
///
/// Serializes as `{"command": "...", "value": {...}}`; commands without
/// arguments carry no `value`.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "command", content = "value", rename_all = "camelCase")]
pub enum DeviceCommand {
    SetOutput {
        output: u8,
        state: bool,
    },
    GetStatus,
    Restart,
    SetMode {
        auto: bool,
        threshold: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        hysteresis: Option<f64>,
    },
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::SetOutput { .. } => "setOutput",
            DeviceCommand::GetStatus => "getStatus",
            DeviceCommand::Restart => "restart",
            DeviceCommand::SetMode { .. } => "setMode",
        }
    }
}

// Payload field names
pub const TEMPERATURE_KEYS: &[&str] = &["temperature", "Temperature"];
pub const HUMIDITY_KEYS: &[&str] = &["humidity", "Humidity"];

/// First candidate key holding a number. Keys are tried in order; `null` or
/// non-numeric values fall through to the next candidate.
pub fn resolve_number(payload: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_f64))
}

pub fn number_field(payload: &Map<String, Value>, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

pub fn string_field<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

pub fn bool_field(payload: &Map<String, Value>, key: &str) -> Option<bool> {
    payload.get(key).and_then(Value::as_bool)
}

/// Payload `timestamp` in epoch milliseconds, if present.
pub fn timestamp_millis(payload: &Map<String, Value>) -> Option<i64> {
    number_field(payload, "timestamp").map(|ms| ms as i64)
}

/// Local wall-clock label (`HH:MM:SS`) for an epoch-millisecond instant.
pub fn format_time_label(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(at) => at.format("%H:%M:%S").to_string(),
        None => Local::now().format("%H:%M:%S").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn commands_match_device_envelope() {
        let cases = [
            (
                DeviceCommand::SetOutput { output: 1, state: true },
                json!({"command": "setOutput", "value": {"output": 1, "state": true}}),
            ),
            (DeviceCommand::GetStatus, json!({"command": "getStatus"})),
            (DeviceCommand::Restart, json!({"command": "restart"})),
            (
                DeviceCommand::SetMode { auto: true, threshold: 80.0, hysteresis: Some(0.5) },
                json!({"command": "setMode", "value": {"auto": true, "threshold": 80.0, "hysteresis": 0.5}}),
            ),
            (
                DeviceCommand::SetMode { auto: false, threshold: 42.0, hysteresis: None },
                json!({"command": "setMode", "value": {"auto": false, "threshold": 42.0}}),
            ),
        ];

        for (command, expected) in cases {
            assert_eq!(serde_json::to_value(&command).unwrap(), expected, "{}", command.name());
        }
    }

    #[test]
    fn current_key_wins_over_legacy_key() {
        let both = object(json!({"temperature": 21.5, "Temperature": 99.0}));
        assert_eq!(resolve_number(&both, TEMPERATURE_KEYS), Some(21.5));

        let legacy = object(json!({"Temperature": 19.0}));
        assert_eq!(resolve_number(&legacy, TEMPERATURE_KEYS), Some(19.0));

        let null_current = object(json!({"temperature": null, "Temperature": 18.0}));
        assert_eq!(resolve_number(&null_current, TEMPERATURE_KEYS), Some(18.0));

        let missing = object(json!({"humidity": 40}));
        assert_eq!(resolve_number(&missing, TEMPERATURE_KEYS), None);
    }

    #[test]
    fn payload_must_be_a_json_object() {
        let msg = InboundMessage::from_topic("esp32/status", b"[1,2]");
        assert!(matches!(msg.json_object(), Err(PayloadError::NotAnObject)));

        let msg = InboundMessage::from_topic("esp32/status", b"{not json");
        assert!(matches!(msg.json_object(), Err(PayloadError::Json(_))));
    }

    #[test]
    fn time_label_is_clock_time() {
        let label = format_time_label(1_700_000_000_000);
        assert_eq!(label.len(), 8);
        assert_eq!(label.matches(':').count(), 2);
    }
}
