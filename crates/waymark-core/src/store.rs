//! Pluggable persistence for ledger state.
//!
//! The ledger serializes its durable state to JSON and hands it to a
//! [`Store`] keyed by session id. The engine ships an in-memory store for
//! tests and embedding; durable backends implement the same two calls.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use crate::error::EngineError;

/// A keyed blob store for serialized ledger state.
pub trait Store: Send + Sync {
    /// Writes `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the backend cannot persist.
    fn put(&self, key: &str, value: serde_json::Value) -> Result<(), EngineError>;

    /// Reads the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, EngineError>;
}

/// In-memory [`Store`] backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Returns true when nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemoryStore {
    fn put(&self, key: &str, value: serde_json::Value) -> Result<(), EngineError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| EngineError::Store("store mutex poisoned".to_string()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, EngineError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| EngineError::Store("store mutex poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.len())
            .finish()
    }
}
