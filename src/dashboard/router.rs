//! Maps inbound device messages onto [`DomainState`].
//!
//! Routing is a pure step: it parses one message, mutates the state and
//! reports whether anything was routed. Notification is left to the caller.

use serde_json::{Map, Value};
use tracing::trace;

use super::state::{DomainState, TelemetryPoint, WifiState};
use crate::mqtt::message_manager::{
    bool_field, format_time_label, number_field, resolve_number, string_field, timestamp_millis,
    InboundMessage, PayloadError, HUMIDITY_KEYS, TEMPERATURE_KEYS,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Channel {
    Status,
    Temperature,
    Outputs,
}

impl DomainState {
    /// Applies `message` to the state.
    ///
    /// Returns `Ok(false)` for topics the dashboard does not listen on. A
    /// payload that is not a JSON object is an error and leaves the state
    /// untouched.
    pub(crate) fn route(&mut self, message: &InboundMessage) -> Result<bool, PayloadError> {
        let Some(channel) = self.channel_of(&message.topic) else {
            trace!("No route for {}", message.topic);
            return Ok(false);
        };
        let payload = message.json_object()?;
        let now = message.received_at.timestamp_millis();

        match channel {
            Channel::Status => self.apply_status(&payload, now),
            Channel::Temperature => self.apply_telemetry(&payload, now),
            Channel::Outputs => self.apply_outputs(&payload),
        }
        Ok(true)
    }

    fn channel_of(&self, topic: &str) -> Option<Channel> {
        if topic == self.topics.status {
            Some(Channel::Status)
        } else if topic == self.topics.temperature {
            Some(Channel::Temperature)
        } else if topic == self.topics.outputs {
            Some(Channel::Outputs)
        } else {
            None
        }
    }

    fn apply_status(&mut self, payload: &Map<String, Value>, now: i64) {
        let device = &mut self.device;
        if let Some(id) = string_field(payload, "device").filter(|id| !id.is_empty()) {
            device.device_id = id.to_string();
        }
        if let Some(rssi) = number_field(payload, "wifi_rssi") {
            device.rssi = Some(rssi as i64);
        }
        if let Some(uptime) = number_field(payload, "uptime") {
            device.uptime = Some(uptime.max(0.0) as u64);
        }
        if let Some(heap) = number_field(payload, "free_heap") {
            device.heap = Some(heap.max(0.0) as u64);
        }
        if let Some(status) = string_field(payload, "status").filter(|s| !s.is_empty()) {
            device.wifi = if status == "online" {
                WifiState::Connected
            } else {
                WifiState::Offline
            };
        }
        device.last_status_at = Some(timestamp_millis(payload).unwrap_or(now));
    }

    fn apply_telemetry(&mut self, payload: &Map<String, Value>, now: i64) {
        let time = format_time_label(timestamp_millis(payload).unwrap_or(now));
        if let Some(value) = resolve_number(payload, TEMPERATURE_KEYS) {
            self.temperature.push(TelemetryPoint {
                time: time.clone(),
                value: Some(value),
            });
        }
        if let Some(value) = resolve_number(payload, HUMIDITY_KEYS) {
            self.humidity.push(TelemetryPoint {
                time,
                value: Some(value),
            });
        }
    }

    fn apply_outputs(&mut self, payload: &Map<String, Value>) {
        let Some(Value::Object(outputs)) = payload.get("outputs") else {
            return;
        };
        if let Some(on) = bool_field(outputs, "out1") {
            self.outputs.out1 = on;
        }
        if let Some(on) = bool_field(outputs, "out2") {
            self.outputs.out2 = on;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, UiSettings};
    use crate::dashboard::state::{DeviceState, OutputsState, UNKNOWN_DEVICE};

    fn state() -> DomainState {
        DomainState::new(BrokerConfig::default(), UiSettings::default())
    }

    fn msg(topic: &str, text: &str) -> InboundMessage {
        InboundMessage::from_topic(topic, text.as_bytes())
    }

    #[test]
    fn status_updates_only_present_fields() {
        let mut s = state();
        s.route(&msg(
            "esp32/status",
            r#"{"device":"esp32-a1","status":"online","uptime":120,"wifi_rssi":-50,"free_heap":40000,"timestamp":1700000000000}"#,
        ))
        .unwrap();
        assert_eq!(
            s.device,
            DeviceState {
                device_id: "esp32-a1".into(),
                wifi: WifiState::Connected,
                rssi: Some(-50),
                uptime: Some(120),
                heap: Some(40000),
                last_status_at: Some(1_700_000_000_000),
            }
        );

        let before = s.device.clone();
        assert!(s.route(&msg("esp32/status", r#"{"wifi_rssi":-65}"#)).unwrap());
        assert_eq!(s.device.rssi, Some(-65));
        assert_eq!(s.device.device_id, before.device_id);
        assert_eq!(s.device.uptime, before.uptime);
        assert_eq!(s.device.heap, before.heap);
        assert_eq!(s.device.wifi, WifiState::Connected);
    }

    #[test]
    fn status_without_timestamp_uses_receive_time() {
        let mut s = state();
        let m = msg("esp32/status", r#"{"status":"offline"}"#);
        s.route(&m).unwrap();
        assert_eq!(s.device.wifi, WifiState::Offline);
        assert_eq!(s.device.last_status_at, Some(m.received_at.timestamp_millis()));
        assert_eq!(s.device.device_id, UNKNOWN_DEVICE);
    }

    #[test]
    fn telemetry_appends_only_resolved_values() {
        let mut s = state();
        s.route(&msg("esp32/temperature", r#"{"temperature":21.5,"humidity":40}"#))
            .unwrap();
        s.route(&msg("esp32/temperature", r#"{"Temperature":22.0,"humidity":null}"#))
            .unwrap();
        s.route(&msg("esp32/temperature", r#"{"pressure":1013}"#)).unwrap();

        let temps: Vec<_> = s.temperature.snapshot().into_iter().map(|p| p.value).collect();
        let hums: Vec<_> = s.humidity.snapshot().into_iter().map(|p| p.value).collect();
        assert_eq!(temps, vec![Some(21.5), Some(22.0)]);
        assert_eq!(hums, vec![Some(40.0)]);
    }

    #[test]
    fn telemetry_label_follows_payload_timestamp() {
        let mut s = state();
        s.route(&msg("esp32/temperature", r#"{"temperature":20,"timestamp":1700000000000}"#))
            .unwrap();
        assert_eq!(
            s.temperature.snapshot()[0].time,
            format_time_label(1_700_000_000_000)
        );
    }

    #[test]
    fn outputs_take_only_boolean_fields() {
        let mut s = state();
        s.route(&msg("esp32/outputs", r#"{"outputs":{"out1":true,"out2":"yes"}}"#))
            .unwrap();
        assert_eq!(s.outputs, OutputsState { out1: true, out2: false });

        s.route(&msg("esp32/outputs", r#"{"outputs":{"out2":true}}"#)).unwrap();
        assert_eq!(s.outputs, OutputsState { out1: true, out2: true });

        assert!(s.route(&msg("esp32/outputs", r#"{"timestamp":1}"#)).unwrap());
        assert_eq!(s.outputs, OutputsState { out1: true, out2: true });
    }

    #[test]
    fn malformed_payload_leaves_state_untouched() {
        let mut s = state();
        assert!(s.route(&msg("esp32/status", "{oops")).is_err());
        assert!(s.route(&msg("esp32/outputs", "true")).is_err());
        assert_eq!(s.device, DeviceState::default());
        assert_eq!(s.outputs, OutputsState::default());
    }

    #[test]
    fn unknown_topics_are_not_routed() {
        let mut s = state();
        assert!(!s.route(&msg("esp32/commands", r#"{"command":"restart"}"#)).unwrap());
        assert!(!s.route(&msg("other/status", "{oops")).unwrap());
    }
}
