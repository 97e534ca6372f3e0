//! # Persistence
//!
//! The dashboard keeps two independent settings records, each stored as a TOML
//! blob under its own key:
//!
//! | key      | record                               |
//! |----------|--------------------------------------|
//! | `broker` | [`BrokerConfig`]                     |
//! | `ui`     | [`UiSettings`]                       |
//!
//! [`SettingsStore`] is the narrow load/save/clear contract a storage backend
//! implements; [`SettingsGateway`] adds (de)serialization on top of it.
//!
//! ## Error Handling Strategy
//! Loading is fail-safe: a missing, unreadable or corrupt record is logged and
//! reported as absent so start-up falls back to defaults. Saving and clearing
//! return their errors to the caller.

pub mod file_store;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{BrokerConfig, UiSettings};

pub use file_store::{FileSettingsStore, MemorySettingsStore};

pub const BROKER_KEY: &str = "broker";
pub const UI_KEY: &str = "ui";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Settings I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Could not parse stored settings: {0}")]
    Deserialize(#[from] toml::de::Error),

    #[error("No configuration directory available on this platform")]
    NoConfigDir,
}

/// Key-value blob storage for settings records.
pub trait SettingsStore: Send + Sync {
    /// The stored blob, or `None` if the key was never saved or was cleared.
    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn save(&self, key: &str, blob: &str) -> Result<(), StoreError>;

    /// Removes the blob. Clearing a missing key is not an error.
    fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Typed access to the persisted settings records.
#[derive(Clone)]
pub struct SettingsGateway {
    store: Arc<dyn SettingsStore>,
}

impl SettingsGateway {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        SettingsGateway { store }
    }

    /// Gateway over a fresh [`MemorySettingsStore`].
    pub fn in_memory() -> Self {
        SettingsGateway::new(Arc::new(MemorySettingsStore::default()))
    }

    pub fn load_broker(&self) -> Option<BrokerConfig> {
        self.load_record(BROKER_KEY)
    }

    pub fn save_broker(&self, config: &BrokerConfig) -> Result<(), StoreError> {
        self.save_record(BROKER_KEY, config)
    }

    /// Stored UI settings; fields missing from the record take their defaults.
    pub fn load_ui(&self) -> Option<UiSettings> {
        self.load_record(UI_KEY)
    }

    pub fn save_ui(&self, settings: &UiSettings) -> Result<(), StoreError> {
        self.save_record(UI_KEY, settings)
    }

    /// Removes both records.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.clear(BROKER_KEY)?;
        self.store.clear(UI_KEY)?;
        debug!("Cleared stored settings");
        Ok(())
    }

    fn load_record<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let blob = match self.store.load(key) {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(e) => {
                warn!("Could not read '{}' settings: {}", key, e);
                return None;
            }
        };
        match toml::from_str(&blob) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring corrupt '{}' settings: {}", key, e);
                None
            }
        }
    }

    fn save_record<T: Serialize>(&self, key: &str, record: &T) -> Result<(), StoreError> {
        let blob = toml::to_string_pretty(record)?;
        self.store.save(key, &blob)?;
        debug!("Saved '{}' settings", key);
        Ok(())
    }
}
