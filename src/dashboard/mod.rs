//! # Dashboard
//!
//! Supervises one device through an [`MqttSession`]:
//!
//! ```text
//! MqttSession ──message──► router ──► DomainState ──change──► observers
//!      ▲        ──state────────────────────────────┘               │
//!      └────────────── commands / settings updates ◄── snapshot() ◄┘
//! ```
//!
//! Observers registered with [`Dashboard::subscribe`] receive a bare change
//! signal and pull the current truth with [`Dashboard::snapshot`]. One signal
//! is emitted per routed message, per connection state change and per command
//! or settings update, always after the mutation it reports.
//!
//! ## Error Handling Strategy
//! Commands are fire-and-forget. Publishing without a link, a rejected
//! request or a malformed inbound payload is logged and otherwise ignored.
//! Only [`Dashboard::connect`] reports failure to its caller.

pub mod router;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::common::{lock, Emitter, Subscription};
use crate::config::{BrokerConfig, Topics, UiSettings, UiSettingsPatch};
use crate::mqtt::{ConnectionState, DeviceCommand, InboundMessage, MqttSession, SessionError};
use crate::persistence::SettingsGateway;

pub use state::{
    DashboardSnapshot, DeviceState, OutputChannel, OutputsState, TelemetryPoint, WifiState,
};

use state::DomainState;

/// Options for [`Dashboard::set_config`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigUpdate {
    /// Save the config through the settings gateway.
    pub persist: bool,
    /// Reconnect with the new config if it differs from the current one.
    pub reconnect: bool,
}

impl Default for ConfigUpdate {
    fn default() -> Self {
        ConfigUpdate {
            persist: true,
            reconnect: true,
        }
    }
}

struct DashboardShared {
    session: MqttSession,
    settings: SettingsGateway,
    state: Mutex<DomainState>,
    changes: Emitter<()>,
    /// Status request and auto-mode push still owed to the device.
    handshake_pending: AtomicBool,
    session_subscriptions: Mutex<Vec<Subscription>>,
}

impl Drop for DashboardShared {
    fn drop(&mut self) {
        for subscription in lock(&self.session_subscriptions).drain(..) {
            subscription.unsubscribe();
        }
        self.session.disconnect();
    }
}

/// Domain aggregator for one device.
///
/// Cloning yields another handle; the session is disconnected when the last
/// handle is dropped.
#[derive(Clone)]
pub struct Dashboard {
    shared: Arc<DashboardShared>,
}

impl Dashboard {
    /// Builds the dashboard around `session`.
    ///
    /// The broker config is taken from the settings store, then from
    /// `initial`, then from the defaults. Stored UI settings are merged over
    /// the defaults.
    pub fn new(
        session: MqttSession,
        settings: SettingsGateway,
        initial: Option<BrokerConfig>,
    ) -> Self {
        let config = settings
            .load_broker()
            .or(initial)
            .unwrap_or_default();
        let ui = settings.load_ui().unwrap_or_default();
        debug!("Dashboard starting with {} and {:?}", config, ui);

        let shared = Arc::new(DashboardShared {
            session: session.clone(),
            settings,
            state: Mutex::new(DomainState::new(config, ui)),
            changes: Emitter::new("change"),
            handshake_pending: AtomicBool::new(false),
            session_subscriptions: Mutex::new(Vec::new()),
        });

        let on_message = {
            let weak = Arc::downgrade(&shared);
            session.on_message(move |message| {
                if let Some(shared) = weak.upgrade() {
                    shared.route(message);
                }
            })
        };
        let on_state = {
            let weak = Arc::downgrade(&shared);
            session.on_state(move |state| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_connection_state(*state);
                }
            })
        };
        lock(&shared.session_subscriptions).extend([on_message, on_state]);

        Dashboard { shared }
    }

    pub fn session(&self) -> &MqttSession {
        &self.shared.session
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.session.state()
    }

    pub fn config(&self) -> BrokerConfig {
        lock(&self.shared.state).config.clone()
    }

    pub fn ui_settings(&self) -> UiSettings {
        lock(&self.shared.state).ui.clone()
    }

    pub fn topics(&self) -> Topics {
        lock(&self.shared.state).topics.clone()
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        let connection = self.shared.session.state();
        lock(&self.shared.state).snapshot(connection)
    }

    /// Registers a change notifier. Read the new state with [`Dashboard::snapshot`].
    pub fn subscribe<F>(&self, on_change: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.changes.on(move |_| on_change())
    }

    /// Connects with the current config, or with `config` after saving it.
    ///
    /// Subscribes to the device topics and sends the device handshake: a
    /// status request, plus the auto-mode parameters when in auto mode. If
    /// the first attempt fails the transport keeps retrying and the handshake
    /// is sent on the next successful connect.
    pub async fn connect(&self, config: Option<BrokerConfig>) -> Result<(), SessionError> {
        if let Some(next) = config {
            self.shared.apply_config(next, true);
            self.shared.notify();
        }

        let (config, topics) = {
            let state = lock(&self.shared.state);
            (state.config.clone(), state.topics.clone())
        };

        match self.shared.session.connect(&config).await {
            Ok(()) => {
                self.shared.subscribe_topics(&topics);
                // a handshake deferred by an earlier failed attempt is covered by this one
                self.shared.handshake_pending.store(false, Ordering::SeqCst);
                self.shared.handshake();
                Ok(())
            }
            Err(SessionError::ConnectCancelled) => {
                debug!("Connect to {} cancelled", config);
                Ok(())
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", config, e);
                if self.shared.session.has_link() {
                    self.shared.subscribe_topics(&topics);
                    self.shared.defer_handshake();
                }
                Err(e)
            }
        }
    }

    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Connects on start-up when a broker URL is known and auto-reconnect is on.
    pub async fn resume(&self) -> Result<(), SessionError> {
        let (auto_reconnect, has_url) = {
            let state = lock(&self.shared.state);
            (state.ui.auto_reconnect, state.config.has_url())
        };
        if !(auto_reconnect && has_url) {
            debug!("Not resuming: auto-reconnect {}, url set {}", auto_reconnect, has_url);
            return Ok(());
        }
        self.connect(None).await
    }

    pub fn request_status(&self) {
        self.shared.request_status();
    }

    /// Switches `channel` to `desired`, or flips it when `desired` is `None`.
    ///
    /// The local state changes immediately; the device's next outputs report
    /// overwrites it. `busy` is set while the command is issued.
    pub fn toggle_output(&self, channel: OutputChannel, desired: Option<bool>) {
        let next = {
            let mut state = lock(&self.shared.state);
            let next = desired.unwrap_or(!state.outputs.get(channel));
            state.busy = true;
            state.outputs.set(channel, next);
            next
        };
        self.shared.notify();

        self.shared.publish(&DeviceCommand::SetOutput {
            output: channel.number(),
            state: next,
        });

        lock(&self.shared.state).busy = false;
        self.shared.notify();
    }

    /// Sends auto-mode parameters to the device. Stored UI settings are not
    /// touched; use [`Dashboard::set_ui_settings`] for that.
    pub fn set_mode(&self, auto: bool, threshold: f64, hysteresis: Option<f64>) {
        self.shared.set_mode(auto, threshold, hysteresis);
    }

    pub fn restart_device(&self) {
        self.shared.publish(&DeviceCommand::Restart);
    }

    /// Empties the temperature and humidity series.
    pub fn clear_telemetry(&self) {
        {
            let mut state = lock(&self.shared.state);
            state.temperature.clear();
            state.humidity.clear();
        }
        self.shared.notify();
    }

    /// Replaces the broker config.
    ///
    /// An unchanged config never reconnects, whatever `update.reconnect` says.
    pub async fn set_config(&self, next: BrokerConfig, update: ConfigUpdate) {
        let changed = self.shared.apply_config(next, update.persist);
        if update.reconnect && changed {
            info!("Broker config changed, reconnecting");
            self.shared.disconnect();
            if let Err(e) = self.connect(None).await {
                debug!("Reconnect after config change: {}", e);
            }
        } else {
            self.shared.notify();
        }
    }

    /// Merges `patch` into the UI settings.
    ///
    /// Afterwards connects if auto-reconnect is on, a URL is set and the
    /// session is disconnected, and pushes changed auto-mode parameters to a
    /// connected device.
    pub fn set_ui_settings(&self, patch: UiSettingsPatch, persist: bool) {
        let (previous, current, has_url) = {
            let mut state = lock(&self.shared.state);
            let previous = state.ui.clone();
            state.ui = previous.merged(&patch);
            (previous, state.ui.clone(), state.config.has_url())
        };
        if persist {
            if let Err(e) = self.shared.settings.save_ui(&current) {
                warn!("Could not save UI settings: {}", e);
            }
        }
        self.shared.notify();

        if current.auto_reconnect
            && has_url
            && self.shared.session.state() == ConnectionState::Disconnected
        {
            self.spawn_connect();
        }

        if previous.auto_params_differ(&current)
            && self.shared.session.state() == ConnectionState::Connected
        {
            self.shared
                .set_mode(current.mode.is_auto(), current.max_temp, Some(current.hysteresis));
        }
    }

    /// Removes the stored broker config and UI settings. Live state is kept.
    pub fn clear_settings(&self) {
        if let Err(e) = self.shared.settings.clear() {
            warn!("Could not clear stored settings: {}", e);
        }
    }

    fn spawn_connect(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, auto-reconnect skipped");
            return;
        };
        let dashboard = self.clone();
        runtime.spawn(async move {
            if let Err(e) = dashboard.connect(None).await {
                debug!("Auto-reconnect attempt: {}", e);
            }
        });
    }
}

impl DashboardShared {
    /// Drops the session link and any handshake still owed to it.
    fn disconnect(&self) {
        self.handshake_pending.store(false, Ordering::SeqCst);
        self.session.disconnect();
    }

    fn notify(&self) {
        self.changes.emit(&());
    }

    fn route(&self, message: &InboundMessage) {
        let routed = lock(&self.state).route(message);
        match routed {
            Ok(true) => self.notify(),
            Ok(false) => {}
            Err(e) => warn!("Dropping message on {}: {} ({})", message.topic, e, message),
        }
    }

    fn on_connection_state(&self, state: ConnectionState) {
        self.notify();
        if state == ConnectionState::Connected && self.handshake_pending.swap(false, Ordering::SeqCst)
        {
            debug!("Sending deferred device handshake");
            self.handshake();
        }
    }

    /// Stores `next` and rederives the topics. Returns whether it differs from
    /// the previous config.
    fn apply_config(&self, next: BrokerConfig, persist: bool) -> bool {
        let changed = {
            let mut state = lock(&self.state);
            let changed = state.config != next;
            state.topics = Topics::from_root(&next.root);
            state.config = next.clone();
            changed
        };
        if persist {
            if let Err(e) = self.settings.save_broker(&next) {
                warn!("Could not save broker config: {}", e);
            }
        }
        changed
    }

    fn subscribe_topics(&self, topics: &Topics) {
        if let Err(e) = self.session.subscribe(&topics.inbound()) {
            warn!("Subscribe failed: {}", e);
        }
    }

    fn handshake(&self) {
        self.request_status();
        let ui = lock(&self.state).ui.clone();
        if ui.mode.is_auto() {
            self.set_mode(true, ui.max_temp, Some(ui.hysteresis));
        }
    }

    fn defer_handshake(&self) {
        self.handshake_pending.store(true, Ordering::SeqCst);
        // the link may have connected before the flag was set
        if self.session.state() == ConnectionState::Connected
            && self.handshake_pending.swap(false, Ordering::SeqCst)
        {
            self.handshake();
        }
    }

    fn request_status(&self) {
        self.publish(&DeviceCommand::GetStatus);
    }

    fn set_mode(&self, auto: bool, threshold: f64, hysteresis: Option<f64>) {
        self.publish(&DeviceCommand::SetMode {
            auto,
            threshold,
            hysteresis,
        });
    }

    fn publish(&self, command: &DeviceCommand) {
        let topic = lock(&self.state).topics.commands.clone();
        let qos = self.session.options().default_qos;
        match self.session.publish_json(&topic, command, qos) {
            Ok(()) => debug!("Sent {} to {}", command.name(), topic),
            Err(e) => warn!("Could not send {}: {}", command.name(), e),
        }
    }
}
