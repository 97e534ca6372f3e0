//! Supervisory client for a single MQTT-connected device.
//!
//! [`dashboard::Dashboard`] is the entry point: it owns the broker session,
//! turns device messages into state and sends device commands.

pub mod common;
pub mod config;
pub mod dashboard;
pub mod endpoint;
pub mod mqtt;
pub mod persistence;
