//! # Connection and behaviour settings
//!
//! Holds the two persisted configuration records of the dashboard:
//! - [`BrokerConfig`]: which broker to talk to and the topic root of the device
//! - [`UiSettings`]: auto-reconnect and the device's auto-mode thresholds
//!
//! Both deserialize with `#[serde(default)]`, so a stored record that lacks a
//! field picks up the compiled-in default for it.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_ROOT: &str = "esp32";
pub const DEFAULT_MAX_TEMP: f64 = 80.0;
pub const DEFAULT_HYSTERESIS: f64 = 0.5;

/// Broker endpoint, credentials and topic namespace.
///
/// `url` is a WebSocket endpoint such as `wss://host:8884/mqtt`. Empty
/// credentials are treated as "no credentials" by the transport.
#[derive(Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    pub root: String,
    pub username: String,
    pub password: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            url: String::new(),
            root: DEFAULT_ROOT.to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl BrokerConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        BrokerConfig {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn has_url(&self) -> bool {
        !self.url.trim().is_empty()
    }

    /// `(username, password)` when a username is set.
    pub fn credentials(&self) -> Option<(String, String)> {
        if self.username.is_empty() {
            None
        } else {
            Some((self.username.clone(), self.password.clone()))
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("url", &self.url)
            .field("root", &self.root)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

impl fmt::Display for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.username.is_empty() {
            write!(f, "{} [{}]", self.url, self.root)
        } else {
            write!(f, "{}@{} [{}]", self.username, self.url, self.root)
        }
    }
}

/// Device control policy.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    #[default]
    Manual,
    Auto,
}

impl ControlMode {
    pub fn is_auto(self) -> bool {
        self == ControlMode::Auto
    }
}

/// Dashboard behaviour settings.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct UiSettings {
    /// Connect automatically whenever a broker URL is configured.
    pub auto_reconnect: bool,
    /// Temperature threshold (°C) pushed to the device in auto mode.
    pub max_temp: f64,
    pub mode: ControlMode,
    /// Switching band (°C) around `max_temp`.
    pub hysteresis: f64,
}

impl Default for UiSettings {
    fn default() -> Self {
        UiSettings {
            auto_reconnect: true,
            max_temp: DEFAULT_MAX_TEMP,
            mode: ControlMode::Manual,
            hysteresis: DEFAULT_HYSTERESIS,
        }
    }
}

/// Partial update for [`UiSettings`]; `None` fields keep their current value.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct UiSettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reconnect: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ControlMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hysteresis: Option<f64>,
}

impl From<UiSettings> for UiSettingsPatch {
    fn from(settings: UiSettings) -> Self {
        UiSettingsPatch {
            auto_reconnect: Some(settings.auto_reconnect),
            max_temp: Some(settings.max_temp),
            mode: Some(settings.mode),
            hysteresis: Some(settings.hysteresis),
        }
    }
}

impl UiSettings {
    /// Applies `patch` on top of `self`. A non-finite hysteresis falls back to
    /// [`DEFAULT_HYSTERESIS`].
    pub fn merged(&self, patch: &UiSettingsPatch) -> UiSettings {
        let mut next = self.clone();
        if let Some(v) = patch.auto_reconnect {
            next.auto_reconnect = v;
        }
        if let Some(v) = patch.max_temp {
            next.max_temp = v;
        }
        if let Some(v) = patch.mode {
            next.mode = v;
        }
        if let Some(v) = patch.hysteresis {
            next.hysteresis = v;
        }
        if !next.hysteresis.is_finite() {
            next.hysteresis = DEFAULT_HYSTERESIS;
        }
        next
    }

    /// True when the parameters that drive the device's auto mode differ.
    pub fn auto_params_differ(&self, other: &UiSettings) -> bool {
        self.mode != other.mode
            || self.max_temp != other.max_temp
            || self.hysteresis != other.hysteresis
    }
}

/// The four device channels under a topic root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    pub status: String,
    pub temperature: String,
    pub outputs: String,
    pub commands: String,
}

impl Topics {
    /// Derives the channel names; trailing slashes on `root` are ignored.
    pub fn from_root(root: &str) -> Self {
        let root = root.trim_end_matches('/');
        Topics {
            status: format!("{root}/status"),
            temperature: format!("{root}/temperature"),
            outputs: format!("{root}/outputs"),
            commands: format!("{root}/commands"),
        }
    }

    /// Device-to-client channels the dashboard listens on.
    pub fn inbound(&self) -> Vec<String> {
        vec![
            self.status.clone(),
            self.temperature.clone(),
            self.outputs.clone(),
        ]
    }
}
