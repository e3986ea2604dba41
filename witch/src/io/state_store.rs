//! Persisted application state (`<data_dir>/state.json`).
//!
//! The state file is a single JSON object mapping scoped keys to arbitrary
//! JSON values. It is the only durable memory the service keeps between
//! process restarts.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, WitchError};

/// Key/value mapping held by the store. Ordered so saved files are stable.
pub type StateMap = BTreeMap<String, Value>;

/// Durable backend for the application state.
pub trait StateProvider: Send + Sync {
    /// Load the persisted mapping. A missing backing file yields an empty map.
    fn load(&self) -> Result<StateMap>;
    /// Persist the whole mapping, replacing the previous contents atomically.
    fn save(&self, state: &StateMap) -> Result<()>;
}

/// State provider backed by a pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct JsonStateProvider {
    path: PathBuf,
}

impl JsonStateProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateProvider for JsonStateProvider {
    fn load(&self) -> Result<StateMap> {
        debug!(path = %self.path.display(), "loading application state");
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "state file missing, starting empty");
                return Ok(StateMap::new());
            }
            Err(err) => return Err(WitchError::persistence(&self.path, format!("read: {err}"))),
        };
        let state: StateMap = serde_json::from_str(&contents)
            .map_err(|err| WitchError::persistence(&self.path, format!("parse: {err}")))?;
        debug!(entries = state.len(), "application state loaded");
        Ok(state)
    }

    /// Atomically write state to disk (temp file + rename).
    fn save(&self, state: &StateMap) -> Result<()> {
        debug!(path = %self.path.display(), entries = state.len(), "writing application state");
        let mut buf = serde_json::to_string_pretty(state)
            .map_err(|err| WitchError::persistence(&self.path, format!("serialize: {err}")))?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| {
        WitchError::persistence(path, format!("create directory {}: {err}", parent.display()))
    })?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents).map_err(|err| {
        WitchError::persistence(path, format!("write temp {}: {err}", tmp_path.display()))
    })?;
    fs::rename(&tmp_path, path)
        .map_err(|err| WitchError::persistence(path, format!("replace: {err}")))?;
    Ok(())
}

/// Shared, write-through application state.
///
/// Loaded once at startup. Every mutation is persisted before the call
/// returns; the lock is held across the save so concurrent writers from
/// different namespaces never interleave their snapshots.
pub struct StateStore {
    provider: Box<dyn StateProvider>,
    entries: Mutex<StateMap>,
}

impl StateStore {
    pub fn open<P: StateProvider + 'static>(provider: P) -> Result<Self> {
        let entries = provider.load()?;
        Ok(Self {
            provider: Box::new(provider),
            entries: Mutex::new(entries),
        })
    }

    /// Open the JSON state file at `path`.
    pub fn open_json(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(JsonStateProvider::new(path))
    }

    fn lock(&self) -> MutexGuard<'_, StateMap> {
        // A panic while holding the lock cannot leave a half-applied map: every
        // mutation is a single insert/remove.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Insert `value` under `key` and persist. The in-memory map is rolled back
    /// if the save fails.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.lock();
        let previous = entries.insert(key.to_string(), value);
        if let Err(err) = self.provider.save(&entries) {
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<Option<Value>> {
        let mut entries = self.lock();
        let Some(previous) = entries.remove(key) else {
            return Ok(None);
        };
        if let Err(err) = self.provider.save(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(err);
        }
        Ok(Some(previous))
    }

    /// Copy of the whole mapping.
    pub fn snapshot(&self) -> StateMap {
        self.lock().clone()
    }

    /// Keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }
}
