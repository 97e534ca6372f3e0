//! # Broker link
//!
//! The session does not speak MQTT itself. It asks a [`Connector`] to open a
//! link, gets back a [`BrokerLink`] for outbound requests plus a channel of
//! [`LinkEvent`]s, and reacts to those events.
//!
//! [`RumqttConnector`] is the production connector. It drives a `rumqttc`
//! event loop over WebSockets in a background task:
//!
//! ```text
//! EventLoop::poll ─► driver task ─[LinkEvent]─► MqttSession pump
//!        ▲                                          │
//!        └──────── AsyncClient (subscribe/publish) ◄┘
//! ```

use std::sync::{Arc, Mutex};

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, NetworkOptions, Packet, QoS,
    SubscribeFilter, SubscribeReasonCode, Transport,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::config::SessionOptions;
use super::message_manager::InboundMessage;
use crate::common::lock;
use crate::config::BrokerConfig;

/// Something that happened on a link, in the order the transport saw it.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Handshake completed (first connect or after a retry).
    Connected,
    /// A new connection attempt is starting or the link was lost.
    Reconnecting,
    /// The broker closed the connection.
    Closed,
    Message(InboundMessage),
    /// A connection attempt or the live connection failed.
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Request queue rejected {0}: {1}")]
    Rejected(&'static str, String),
}

/// Outbound half of an open link.
///
/// Requests are queued without waiting for the broker.
pub trait BrokerLink: Send + Sync {
    /// Requests `topics`; the link re-subscribes them after every reconnect.
    fn subscribe(&self, topics: &[String], qos: QoS) -> Result<(), LinkError>;

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), LinkError>;

    /// Tears the link down immediately. Its event channel closes afterwards.
    fn terminate(&self);
}

pub struct LinkParts {
    pub link: Box<dyn BrokerLink>,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Opens broker links. Must be called from within a tokio runtime.
pub trait Connector: Send + Sync {
    fn open(&self, config: &BrokerConfig, options: &SessionOptions) -> LinkParts;
}

/// [`Connector`] backed by `rumqttc` over `ws://` or `wss://`.
#[derive(Debug, Default, Clone)]
pub struct RumqttConnector;

impl Connector for RumqttConnector {
    fn open(&self, config: &BrokerConfig, options: &SessionOptions) -> LinkParts {
        let mqtt_options = mqtt_options(config, options);
        let (client, mut eventloop) = AsyncClient::new(mqtt_options, options.request_capacity);

        let mut network = NetworkOptions::new();
        network.set_connection_timeout(options.connect_timeout.as_secs().max(1));
        eventloop.set_network_options(network);

        let (tx, rx) = mpsc::channel(options.request_capacity.max(16));
        let topics = Arc::new(Mutex::new(Vec::<(String, QoS)>::new()));
        let cancel = CancellationToken::new();

        let driver = Driver {
            client: client.clone(),
            topics: topics.clone(),
            events: tx,
            reconnect_period: options.reconnect_period,
        };
        tokio::spawn(driver.run(eventloop, cancel.clone()));

        info!("Opened broker link to {}", config);
        LinkParts {
            link: Box::new(RumqttLink {
                client,
                topics,
                cancel,
            }),
            events: rx,
        }
    }
}

/// Builds rumqttc options for a WebSocket endpoint.
///
/// The URL is handed to rumqttc as-is; an unparsable URL simply never connects.
pub fn mqtt_options(config: &BrokerConfig, options: &SessionOptions) -> MqttOptions {
    let url = config.url.trim();
    // for ws/wss rumqttc reads host and port from the URL itself; the port
    // here only keeps the options' broker address consistent with it
    let (secure, port) = endpoint_port(url);

    let mut mqtt_options = MqttOptions::new(options.client_id.clone(), url, port);
    mqtt_options
        .set_keep_alive(options.keep_alive)
        .set_clean_session(options.clean_session);
    if let Some((user, password)) = config.credentials() {
        mqtt_options.set_credentials(user, password);
    }
    if secure {
        mqtt_options.set_transport(Transport::wss_with_default_config());
    } else {
        mqtt_options.set_transport(Transport::Ws);
    }
    mqtt_options
}

/// `(secure, port)` for a WebSocket URL; 443/80 when no port is given.
pub fn endpoint_port(url: &str) -> (bool, u16) {
    match Url::parse(url) {
        Ok(parsed) => {
            let secure = parsed.scheme() != "ws";
            let default_port = if secure { 443 } else { 80 };
            (secure, parsed.port().unwrap_or(default_port))
        }
        Err(e) => {
            warn!("Broker URL '{}' does not parse: {}", url, e);
            (true, 443)
        }
    }
}

struct RumqttLink {
    client: AsyncClient,
    topics: Arc<Mutex<Vec<(String, QoS)>>>,
    cancel: CancellationToken,
}

impl BrokerLink for RumqttLink {
    fn subscribe(&self, topics: &[String], qos: QoS) -> Result<(), LinkError> {
        {
            let mut known = lock(&self.topics);
            for topic in topics {
                if !known.iter().any(|(t, _)| t == topic) {
                    known.push((topic.clone(), qos));
                }
            }
        }
        let filters = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), qos));
        self.client
            .try_subscribe_many(filters)
            .map_err(|e| LinkError::Rejected("subscribe", e.to_string()))
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), LinkError> {
        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| LinkError::Rejected("publish", e.to_string()))
    }

    fn terminate(&self) {
        self.cancel.cancel();
    }
}

struct Driver {
    client: AsyncClient,
    topics: Arc<Mutex<Vec<(String, QoS)>>>,
    events: mpsc::Sender<LinkEvent>,
    reconnect_period: std::time::Duration,
}

impl Driver {
    async fn run(self, mut eventloop: EventLoop, cancel: CancellationToken) {
        let mut connected = false;

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = eventloop.poll() => polled,
            };

            let keep_going = match polled {
                Ok(event) => self.on_event(event, &mut connected).await,
                Err(e) => self.on_error(e, &mut connected, &cancel).await,
            };
            if !keep_going {
                break;
            }
        }
        debug!("Broker link driver stopped");
    }

    async fn on_event(&self, event: Event, connected: &mut bool) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                *connected = true;
                self.resubscribe();
                self.forward(LinkEvent::Connected).await
            }
            Event::Incoming(Packet::Publish(p)) => {
                self.forward(LinkEvent::Message(InboundMessage::from_topic(p.topic, &p.payload)))
                    .await
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let failed = ack
                    .return_codes
                    .iter()
                    .filter(|c| matches!(c, SubscribeReasonCode::Failure))
                    .count();
                if failed > 0 {
                    warn!("Broker rejected {} subscription(s) (pkid {})", failed, ack.pkid);
                }
                true
            }
            Event::Incoming(Packet::Disconnect) => {
                *connected = false;
                self.forward(LinkEvent::Closed).await
            }
            _ => true,
        }
    }

    async fn on_error(
        &self,
        e: ConnectionError,
        connected: &mut bool,
        cancel: &CancellationToken,
    ) -> bool {
        if !self.forward(LinkEvent::Failed(e.to_string())).await {
            return false;
        }
        if *connected {
            *connected = false;
            if !self.forward(LinkEvent::Reconnecting).await {
                return false;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(self.reconnect_period) => {}
        }
        self.forward(LinkEvent::Reconnecting).await
    }

    fn resubscribe(&self) {
        let filters = self.resubscribe_filters();
        if filters.is_empty() {
            return;
        }
        if let Err(e) = self.client.try_subscribe_many(filters) {
            error!("Re-subscribe after connect failed: {}", e);
        }
    }

    /// Every topic requested on this link so far.
    fn resubscribe_filters(&self) -> Vec<SubscribeFilter> {
        lock(&self.topics)
            .iter()
            .map(|(topic, qos)| SubscribeFilter::new(topic.clone(), *qos))
            .collect()
    }

    /// `false` once the session stopped listening.
    async fn forward(&self, event: LinkEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}
