//! Log Persistence
//!
//! The token log survives restarts through a small string key-value store.
//! Persistence failures never interrupt a step; they are logged and the
//! simulation carries on with its in-memory log.

use crate::token::LogEntry;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// String key-value storage for the serialized token log.
pub trait LogStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// In-process store, suitable for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let items = self
            .items
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        items.remove(key);
        Ok(())
    }
}

/// Serialize and write the log under `key`. Errors are logged, not raised.
pub(crate) fn save_log(store: &dyn LogStore, key: &str, log: &[LogEntry]) {
    match serde_json::to_string(log) {
        Ok(json) => {
            if let Err(e) = store.set_item(key, &json) {
                warn!(key, error = %e, "failed to persist token log");
            }
        }
        Err(e) => warn!(key, error = %e, "failed to serialize token log"),
    }
}

/// Read and parse the log under `key`; any failure yields an empty log.
pub(crate) fn load_log(store: &dyn LogStore, key: &str) -> Vec<LogEntry> {
    let raw = match store.get_item(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(key, error = %e, "failed to read token log");
            return Vec::new();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(key, error = %e, "discarding malformed token log");
            Vec::new()
        }
    }
}

/// Delete the persisted log. Errors are logged, not raised.
pub(crate) fn clear_log(store: &dyn LogStore, key: &str) {
    if let Err(e) = store.remove_item(key) {
        warn!(key, error = %e, "failed to clear persisted token log");
    }
}
