//! # MQTT transport
//!
//! Everything between the dashboard and the broker:
//!
//! ```text
//! mqtt/
//! ├── config.rs           - transport tuning (keep-alive, retry period, QoS, client id)
//! ├── link.rs             - broker capability seam and the rumqttc driver
//! ├── message_manager.rs  - inbound messages, command envelope, payload fields
//! └── mqtt_handler.rs     - MqttSession: connection lifecycle and event streams
//! ```
//!
//! The session owns at most one link. It publishes two event streams, `state`
//! and `message`, which the dashboard listens to. Reconnects, retry backoff
//! and resubscription happen inside the link; the session only observes them.

pub mod config;
pub mod link;
pub mod message_manager;
pub mod mqtt_handler;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SessionOptions;
pub use link::{BrokerLink, Connector, LinkEvent, RumqttConnector};
pub use message_manager::{DeviceCommand, InboundMessage};
pub use mqtt_handler::{ConnectionState, MqttSession, SessionError};
