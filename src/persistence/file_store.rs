use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use super::{SettingsStore, StoreError};
use crate::common::lock;

const APP_DIR: &str = "devicedash";

/// Stores each key as `<dir>/<key>.toml`.
///
/// I/O is blocking `std::fs` and runs on the calling thread, also when the
/// caller is an async task. Records are a few hundred bytes.
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    dir: PathBuf,
}

impl FileSettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileSettingsStore { dir: dir.into() }
    }

    /// Store under the platform configuration directory, e.g.
    /// `~/.config/devicedash` on Linux.
    pub fn in_config_dir() -> Result<Self, StoreError> {
        let base = dirs::config_dir().ok_or(StoreError::NoConfigDir)?;
        Ok(FileSettingsStore::new(base.join(APP_DIR)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.toml"))
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, blob: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        fs::write(&path, blob)?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store, used in tests and when no config directory exists.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn blob(&self, key: &str) -> Option<String> {
        lock(&self.blobs).get(key).cloned()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.blob(key))
    }

    fn save(&self, key: &str, blob: &str) -> Result<(), StoreError> {
        lock(&self.blobs).insert(key.to_string(), blob.to_string());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.blobs).remove(key);
        Ok(())
    }
}
