use serde::Serialize;

use crate::common::ring_buffer::{RingBuffer, TELEMETRY_CAPACITY};
use crate::config::{BrokerConfig, Topics, UiSettings};
use crate::mqtt::ConnectionState;

pub const UNKNOWN_DEVICE: &str = "unknown";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WifiState {
    Connected,
    Ap,
    Offline,
    #[default]
    Unknown,
}

/// Last reported device health. Fields are `None` until the device reports them.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub device_id: String,
    pub wifi: WifiState,
    /// dBm
    pub rssi: Option<i64>,
    /// Seconds since device boot.
    pub uptime: Option<u64>,
    /// Free heap in bytes.
    pub heap: Option<u64>,
    /// Epoch milliseconds of the last status message.
    pub last_status_at: Option<i64>,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            device_id: UNKNOWN_DEVICE.to_string(),
            wifi: WifiState::Unknown,
            rssi: None,
            uptime: None,
            heap: None,
            last_status_at: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetryPoint {
    /// Wall-clock label, `HH:MM:SS`.
    pub time: String,
    pub value: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OutputsState {
    pub out1: bool,
    pub out2: bool,
}

impl OutputsState {
    pub fn get(&self, channel: OutputChannel) -> bool {
        match channel {
            OutputChannel::One => self.out1,
            OutputChannel::Two => self.out2,
        }
    }

    pub fn set(&mut self, channel: OutputChannel, on: bool) {
        match channel {
            OutputChannel::One => self.out1 = on,
            OutputChannel::Two => self.out2 = on,
        }
    }
}

/// Switchable device output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputChannel {
    One = 1,
    Two = 2,
}

impl OutputChannel {
    /// Wire number used in `setOutput` commands.
    pub fn number(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for OutputChannel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OutputChannel::One),
            2 => Ok(OutputChannel::Two),
            other => Err(other),
        }
    }
}

/// Point-in-time copy of everything the dashboard knows.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub connection: ConnectionState,
    pub device: DeviceState,
    pub temperature: Vec<TelemetryPoint>,
    pub humidity: Vec<TelemetryPoint>,
    pub outputs: OutputsState,
    pub busy: bool,
    #[serde(skip)]
    pub config: BrokerConfig,
    pub ui: UiSettings,
}

/// Mutable domain state behind the dashboard lock.
pub(crate) struct DomainState {
    pub config: BrokerConfig,
    pub ui: UiSettings,
    pub topics: Topics,
    pub device: DeviceState,
    pub temperature: RingBuffer<TelemetryPoint>,
    pub humidity: RingBuffer<TelemetryPoint>,
    pub outputs: OutputsState,
    pub busy: bool,
}

impl DomainState {
    pub fn new(config: BrokerConfig, ui: UiSettings) -> Self {
        DomainState {
            topics: Topics::from_root(&config.root),
            config,
            ui,
            device: DeviceState::default(),
            temperature: RingBuffer::new(TELEMETRY_CAPACITY),
            humidity: RingBuffer::new(TELEMETRY_CAPACITY),
            outputs: OutputsState::default(),
            busy: false,
        }
    }

    pub fn snapshot(&self, connection: ConnectionState) -> DashboardSnapshot {
        DashboardSnapshot {
            connection,
            device: self.device.clone(),
            temperature: self.temperature.snapshot(),
            humidity: self.humidity.snapshot(),
            outputs: self.outputs,
            busy: self.busy,
            config: self.config.clone(),
            ui: self.ui.clone(),
        }
    }
}
