use std::sync::{Arc, Mutex, PoisonError, Weak};

use rumqttc::QoS;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::config::SessionOptions;
use super::link::{BrokerLink, Connector, LinkError, LinkEvent, LinkParts, RumqttConnector};
use super::message_manager::InboundMessage;
use crate::common::{lock, Emitter, Subscription};
use crate::config::BrokerConfig;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Reconnecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("MQTT not connected")]
    NotConnected,

    #[error("Connect attempt failed: {0}")]
    ConnectFailed(String),

    #[error("Connect attempt cancelled by disconnect")]
    ConnectCancelled,

    #[error("Could not encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Link(#[from] LinkError),
}

type ConnectOutcome = Option<Result<(), String>>;

struct SessionInner {
    state: ConnectionState,
    link: Option<Arc<dyn BrokerLink>>,
    /// Settles the in-flight connect attempt; joiners subscribe to it.
    pending: Option<watch::Sender<ConnectOutcome>>,
    /// Bumped per opened link so events of a dropped link are ignored.
    generation: u64,
}

struct SessionShared {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    inner: Mutex<SessionInner>,
    state_events: Emitter<ConnectionState>,
    message_events: Emitter<InboundMessage>,
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = inner.link.take() {
            link.terminate();
        }
    }
}

/// Owns at most one broker link and reports its lifecycle.
///
/// State moves `Disconnected → Reconnecting → Connected`, back to
/// `Reconnecting` when the transport loses the link, and to `Disconnected`
/// on [`MqttSession::disconnect`] or when the broker closes the connection.
/// Every transition is emitted, also repeated ones.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct MqttSession {
    shared: Arc<SessionShared>,
}

impl MqttSession {
    pub fn new(connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        MqttSession {
            shared: Arc::new(SessionShared {
                connector,
                options,
                inner: Mutex::new(SessionInner {
                    state: ConnectionState::Disconnected,
                    link: None,
                    pending: None,
                    generation: 0,
                }),
                state_events: Emitter::new("state"),
                message_events: Emitter::new("message"),
            }),
        }
    }

    /// Session over `rumqttc` with default transport options.
    pub fn rumqtt() -> Self {
        MqttSession::new(Arc::new(RumqttConnector), SessionOptions::default())
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.inner).state
    }

    pub fn client_id(&self) -> &str {
        &self.shared.options.client_id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.shared.options
    }

    /// True while a link object exists, whatever its connection state.
    pub fn has_link(&self) -> bool {
        lock(&self.shared.inner).link.is_some()
    }

    pub fn on_state<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.shared.state_events.on(handler)
    }

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.shared.message_events.on(handler)
    }

    /// Opens a link and waits for its first handshake.
    ///
    /// Returns immediately when a link already exists. A second call while an
    /// attempt is in flight waits for that same attempt. A failed attempt is
    /// reported to the callers, but the link stays open and keeps retrying.
    pub async fn connect(&self, config: &BrokerConfig) -> Result<(), SessionError> {
        let mut outcome = {
            let mut inner = lock(&self.shared.inner);
            let joined = inner.pending.as_ref().map(watch::Sender::subscribe);
            if let Some(rx) = joined {
                debug!("Connect attempt already in flight, joining it");
                rx
            } else if inner.link.is_some() {
                debug!("Link already open, connect ignored");
                return Ok(());
            } else {
                inner.generation += 1;
                let generation = inner.generation;
                let LinkParts { link, events } =
                    self.shared.connector.open(config, &self.shared.options);
                let (tx, rx) = watch::channel(None);
                inner.link = Some(Arc::from(link));
                inner.pending = Some(tx);
                inner.state = ConnectionState::Reconnecting;
                drop(inner);

                info!("Connecting to {} as {}", config, self.client_id());
                self.shared.state_events.emit(&ConnectionState::Reconnecting);
                tokio::spawn(pump(Arc::downgrade(&self.shared), generation, events));
                rx
            }
        };

        let settled = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => return Err(SessionError::ConnectCancelled),
        };
        match settled {
            Some(Err(reason)) => Err(SessionError::ConnectFailed(reason)),
            _ => Ok(()),
        }
    }

    /// Terminates the link. No-op without one; safe during a connect attempt.
    pub fn disconnect(&self) {
        let (link, pending) = {
            let mut inner = lock(&self.shared.inner);
            let Some(link) = inner.link.take() else {
                return;
            };
            inner.generation += 1;
            inner.state = ConnectionState::Disconnected;
            (link, inner.pending.take())
        };

        link.terminate();
        drop(pending);
        info!("Disconnected from broker");
        self.shared.state_events.emit(&ConnectionState::Disconnected);
    }

    /// Requests subscription to `topics`. Rejections are logged, not returned.
    pub fn subscribe(&self, topics: &[String]) -> Result<(), SessionError> {
        let link = self.link()?;
        match link.subscribe(topics, self.shared.options.default_qos) {
            Ok(()) => debug!("Subscribed to {:?}", topics),
            Err(e) => error!("Subscribe to {:?} failed: {}", topics, e),
        }
        Ok(())
    }

    /// Publishes `payload` serialized as JSON text.
    pub fn publish_json<T>(&self, topic: &str, payload: &T, qos: QoS) -> Result<(), SessionError>
    where
        T: Serialize + ?Sized,
    {
        let link = self.link()?;
        let bytes = serde_json::to_vec(payload)?;
        link.publish(topic, bytes, qos)?;
        debug!("Published to {}", topic);
        Ok(())
    }

    fn link(&self) -> Result<Arc<dyn BrokerLink>, SessionError> {
        lock(&self.shared.inner)
            .link
            .clone()
            .ok_or(SessionError::NotConnected)
    }
}

impl SessionShared {
    /// Applies one link event. Returns `false` once the link is stale.
    fn handle_link_event(&self, generation: u64, event: LinkEvent) -> bool {
        match event {
            LinkEvent::Connected => {
                let Some(pending) = self.transition(generation, ConnectionState::Connected) else {
                    return false;
                };
                info!("Connected to broker");
                self.state_events.emit(&ConnectionState::Connected);
                if let Some(tx) = pending {
                    tx.send_replace(Some(Ok(())));
                }
            }
            LinkEvent::Reconnecting => {
                if self.transition(generation, ConnectionState::Reconnecting).is_none() {
                    return false;
                }
                self.state_events.emit(&ConnectionState::Reconnecting);
            }
            LinkEvent::Closed => {
                if self.transition(generation, ConnectionState::Disconnected).is_none() {
                    return false;
                }
                warn!("Broker closed the connection");
                self.state_events.emit(&ConnectionState::Disconnected);
            }
            LinkEvent::Message(message) => {
                if !self.is_current(generation) {
                    return false;
                }
                self.message_events.emit(&message);
            }
            LinkEvent::Failed(reason) => {
                let pending = {
                    let mut inner = lock(&self.inner);
                    if inner.generation != generation {
                        return false;
                    }
                    inner.pending.take()
                };
                warn!("Broker link error: {}", reason);
                if let Some(tx) = pending {
                    tx.send_replace(Some(Err(reason)));
                }
            }
        }
        true
    }

    /// Sets the state if `generation` is current and hands back the pending
    /// connect attempt when the new state is `Connected`.
    fn transition(
        &self,
        generation: u64,
        state: ConnectionState,
    ) -> Option<Option<watch::Sender<ConnectOutcome>>> {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return None;
        }
        inner.state = state;
        if state == ConnectionState::Connected {
            Some(inner.pending.take())
        } else {
            Some(None)
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.inner).generation == generation
    }
}

async fn pump(shared: Weak<SessionShared>, generation: u64, mut events: mpsc::Receiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if !shared.handle_link_event(generation, event) {
            break;
        }
    }
    debug!("Link event pump for generation {} finished", generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::{next, ScriptedConnector};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn session() -> (MqttSession, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::default());
        let session = MqttSession::new(connector.clone(), SessionOptions::default());
        (session, connector)
    }

    fn cfg() -> BrokerConfig {
        BrokerConfig::with_url("wss://broker.test:8884/mqtt")
    }

    fn record_states(session: &MqttSession) -> mpsc::UnboundedReceiver<ConnectionState> {
        let (tx, rx) = unbounded_channel();
        let _ = session.on_state(move |s| {
            let _ = tx.send(*s);
        });
        rx
    }

    #[tokio::test]
    async fn full_lifecycle_emits_every_transition() {
        let (session, connector) = session();
        let mut states = record_states(&session);
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let task = {
            let s = session.clone();
            tokio::spawn(async move { s.connect(&cfg()).await })
        };
        assert_eq!(next(&mut states).await, ConnectionState::Reconnecting);

        let link = connector.last_link().unwrap();
        link.send(LinkEvent::Connected).await;
        task.await.unwrap().unwrap();
        assert_eq!(next(&mut states).await, ConnectionState::Connected);

        link.send(LinkEvent::Failed("link lost".into())).await;
        link.send(LinkEvent::Reconnecting).await;
        assert_eq!(next(&mut states).await, ConnectionState::Reconnecting);
        assert_eq!(session.state(), ConnectionState::Reconnecting);

        session.disconnect();
        assert_eq!(next(&mut states).await, ConnectionState::Disconnected);
        assert!(link.is_terminated());
        assert!(!session.has_link());
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let (session, connector) = session();
        let mut states = record_states(&session);

        let first = {
            let s = session.clone();
            tokio::spawn(async move { s.connect(&cfg()).await })
        };
        assert_eq!(next(&mut states).await, ConnectionState::Reconnecting);
        let second = {
            let s = session.clone();
            tokio::spawn(async move { s.connect(&cfg()).await })
        };
        tokio::task::yield_now().await;

        connector.last_link().unwrap().send(LinkEvent::Connected).await;
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(connector.open_count(), 1);

        // link exists: further connects are no-ops
        session.connect(&cfg()).await.unwrap();
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test]
    async fn failed_attempt_reports_but_keeps_retrying() {
        let (session, connector) = session();
        let mut states = record_states(&session);

        let task = {
            let s = session.clone();
            tokio::spawn(async move { s.connect(&cfg()).await })
        };
        assert_eq!(next(&mut states).await, ConnectionState::Reconnecting);
        let link = connector.last_link().unwrap();

        link.send(LinkEvent::Failed("connection refused".into())).await;
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ConnectFailed(ref r) if r == "connection refused"));
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        assert!(session.has_link());

        link.send(LinkEvent::Reconnecting).await;
        link.send(LinkEvent::Connected).await;
        assert_eq!(next(&mut states).await, ConnectionState::Reconnecting);
        assert_eq!(next(&mut states).await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_mid_connect_cancels_attempt() {
        let (session, connector) = session();
        let mut states = record_states(&session);

        let task = {
            let s = session.clone();
            tokio::spawn(async move { s.connect(&cfg()).await })
        };
        assert_eq!(next(&mut states).await, ConnectionState::Reconnecting);

        session.disconnect();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ConnectCancelled));
        assert_eq!(next(&mut states).await, ConnectionState::Disconnected);
        assert!(connector.last_link().unwrap().is_terminated());

        // a fresh connect opens a new link
        let task = {
            let s = session.clone();
            tokio::spawn(async move { s.connect(&cfg()).await })
        };
        assert_eq!(next(&mut states).await, ConnectionState::Reconnecting);
        connector.last_link().unwrap().send(LinkEvent::Connected).await;
        task.await.unwrap().unwrap();
        assert_eq!(connector.open_count(), 2);
    }

    #[tokio::test]
    async fn disconnect_without_link_is_a_no_op() {
        let (session, _) = session();
        let mut states = record_states(&session);
        session.disconnect();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), states.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn broker_close_moves_to_disconnected() {
        let (session, connector) = session();
        let mut states = record_states(&session);
        let task = {
            let s = session.clone();
            tokio::spawn(async move { s.connect(&cfg()).await })
        };
        next(&mut states).await;
        let link = connector.last_link().unwrap();
        link.send(LinkEvent::Connected).await;
        task.await.unwrap().unwrap();
        next(&mut states).await;

        link.send(LinkEvent::Closed).await;
        assert_eq!(next(&mut states).await, ConnectionState::Disconnected);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn requests_require_a_link() {
        let (session, _) = session();
        assert!(matches!(
            session.subscribe(&["esp32/status".to_string()]),
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(
            session.publish_json("esp32/commands", &json!({"command": "getStatus"}), QoS::AtLeastOnce),
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn forwards_requests_and_messages_in_order() {
        let (session, connector) = session();
        let mut states = record_states(&session);
        let (tx, mut messages) = unbounded_channel();
        let _ = session.on_message(move |m| {
            let _ = tx.send(m.text.clone());
        });

        let task = {
            let s = session.clone();
            tokio::spawn(async move { s.connect(&cfg()).await })
        };
        next(&mut states).await;
        let link = connector.last_link().unwrap();
        link.send(LinkEvent::Connected).await;
        task.await.unwrap().unwrap();

        session
            .subscribe(&["esp32/status".to_string(), "esp32/outputs".to_string()])
            .unwrap();
        session
            .publish_json("esp32/commands", &json!({"command": "restart"}), QoS::AtMostOnce)
            .unwrap();
        assert_eq!(link.subscribed(), vec!["esp32/status", "esp32/outputs"]);
        assert_eq!(
            link.published(),
            vec![(
                "esp32/commands".to_string(),
                json!({"command": "restart"}),
                QoS::AtMostOnce
            )]
        );

        for text in ["one", "two", "three"] {
            link.send(LinkEvent::Message(InboundMessage::from_topic("esp32/status", text.as_bytes())))
                .await;
        }
        assert_eq!(next(&mut messages).await, "one");
        assert_eq!(next(&mut messages).await, "two");
        assert_eq!(next(&mut messages).await, "three");
    }
}
