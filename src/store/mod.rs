//! Durable key-value state store.
//!
//! Every entity and the household cell persist a JSON record under a string
//! key. A missing key means "never initialized", never an error.
//!
//! # Keys
//! - `entity/{identity}`: one record per tracked entity
//! - `household`: policy, guest override and mirrored mode

use crate::config::StoreConfig;
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

mod sqlite;

pub use sqlite::SqliteStore;


/// Key prefix for per-entity records
pub const ENTITY_PREFIX: &str = "entity/";

/// Key for the household aggregate record
pub const HOUSEHOLD_KEY: &str = "household";

/// Build the store key for an entity
pub fn entity_key(identity: &crate::identity::Identity) -> String {
    format!("{}{}", ENTITY_PREFIX, identity)
}

/// Persistence primitives the presence core calls into
pub trait StateStore: Send + Sync {
    /// Insert or replace the value stored under `key`
    fn save(&self, key: &str, value: &Value) -> Result<()>;

    /// Load the value stored under `key`; `Ok(None)` if never saved
    fn load(&self, key: &str) -> Result<Option<Value>>;

    /// Remove `key`; removing a missing key is not an error
    fn delete(&self, key: &str) -> Result<()>;

    /// List keys starting with `prefix`, sorted
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Open the store described by `config`
///
/// `in_memory` selects [`MemoryStore`]; otherwise the SQLite file at `path`
/// is opened, creating its parent directory if needed.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn StateStore>> {
    if config.in_memory {
        warn!("Using in-memory state store, state will not survive a restart");
        return Ok(Arc::new(MemoryStore::new()));
    }

    if let Some(parent) = config.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(&config.path)?;
    info!(path = %config.path.display(), "State store opened");
    Ok(Arc::new(store))
}

/// Volatile store, selected by `store.in_memory`
#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl StateStore for MemoryStore {
    fn save(&self, key: &str, value: &Value) -> Result<()> {
        self.values.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
