//! Namespaced view over the shared [`StateStore`].

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, WitchError};
use crate::io::state_store::StateStore;

const SEPARATOR: char = ':';

/// Read/write facade that confines an owner to `"<namespace>:<key>"` entries.
///
/// Namespaces cannot contain the separator, so two distinct namespaces never
/// produce the same scoped key.
#[derive(Clone)]
pub struct ScopedState {
    store: Arc<StateStore>,
    namespace: String,
}

impl ScopedState {
    pub fn new(store: Arc<StateStore>, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() || namespace.contains(SEPARATOR) {
            return Err(WitchError::InvalidNamespace(namespace));
        }
        Ok(Self { store, namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn scoped_key(&self, key: &str) -> String {
        format!("{}{SEPARATOR}{key}", self.namespace)
    }

    /// Read and deserialize `key`. Returns `None` when unset.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let scoped = self.scoped_key(key);
        match self.store.get(&scoped) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|err| {
                WitchError::Persistence {
                    path: scoped.into(),
                    message: format!("decode state value: {err}"),
                }
            }),
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Store `value` under `key` and persist the store before returning.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let scoped = self.scoped_key(key);
        let value = serde_json::to_value(value).map_err(|err| WitchError::Persistence {
            path: scoped.clone().into(),
            message: format!("encode state value: {err}"),
        })?;
        self.store.set(&scoped, value)
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.store.remove(&self.scoped_key(key))?.is_some())
    }

    /// Unprefixed keys currently owned by this namespace.
    pub fn keys(&self) -> Vec<String> {
        let prefix = self.scoped_key("");
        self.store
            .keys_with_prefix(&prefix)
            .into_iter()
            .map(|key| key[prefix.len()..].to_string())
            .collect()
    }
}

impl std::fmt::Debug for ScopedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedState")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
