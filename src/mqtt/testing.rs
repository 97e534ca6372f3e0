//! Scripted broker links for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::QoS;
use serde_json::Value;
use tokio::sync::mpsc;

use super::config::SessionOptions;
use super::link::{BrokerLink, Connector, LinkError, LinkEvent, LinkParts};
use crate::config::BrokerConfig;

/// Connector whose links are driven by the test.
#[derive(Default)]
pub struct ScriptedConnector {
    links: Mutex<Vec<ScriptedLink>>,
}

impl ScriptedConnector {
    pub fn open_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn last_link(&self) -> Option<ScriptedLink> {
        self.links.lock().unwrap().last().cloned()
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, config: &BrokerConfig, _options: &SessionOptions) -> LinkParts {
        let (tx, rx) = mpsc::channel(64);
        let link = ScriptedLink {
            state: Arc::new(LinkState {
                config: config.clone(),
                events: Mutex::new(Some(tx)),
                subscribed: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                terminated: AtomicBool::new(false),
            }),
        };
        self.links.lock().unwrap().push(link.clone());
        LinkParts {
            link: Box::new(link),
            events: rx,
        }
    }
}

struct LinkState {
    config: BrokerConfig,
    events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    subscribed: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Value, QoS)>>,
    terminated: AtomicBool,
}

#[derive(Clone)]
pub struct ScriptedLink {
    state: Arc<LinkState>,
}

impl ScriptedLink {
    /// Feeds an event to the session. Ignored once the link is terminated.
    pub async fn send(&self, event: LinkEvent) {
        let tx = self.state.events.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    pub fn config(&self) -> BrokerConfig {
        self.state.config.clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.state.subscribed.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, Value, QoS)> {
        self.state.published.lock().unwrap().clone()
    }

    /// Published payloads only.
    pub fn commands(&self) -> Vec<Value> {
        self.published().into_iter().map(|(_, v, _)| v).collect()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }
}

impl BrokerLink for ScriptedLink {
    fn subscribe(&self, topics: &[String], _qos: QoS) -> Result<(), LinkError> {
        self.state.subscribed.lock().unwrap().extend(topics.iter().cloned());
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), LinkError> {
        let value = serde_json::from_slice(&payload)
            .map_err(|e| LinkError::Rejected("publish", e.to_string()))?;
        self.state
            .published
            .lock()
            .unwrap()
            .push((topic.to_string(), value, qos));
        Ok(())
    }

    fn terminate(&self) {
        self.state.terminated.store(true, Ordering::SeqCst);
        self.state.events.lock().unwrap().take();
    }
}

/// Next item from `rx`, failing the test after one second.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}
