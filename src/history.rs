//! View history on top of an injected key-value store.
//!
//! Feeds "first unviewed" lookups: [`ViewHistory::apply`] stamps stored
//! `viewed_at` times onto a collection before the starting cursor is chosen.

use crate::error::Result;
use crate::model::Collection;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Persistence collaborator.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.map).get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.map).insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Whole-map JSON file, rewritten on every `put`. Writes are serialised
/// under the map lock, so the file always holds the latest map.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = if path.exists() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json)?
        } else {
            BTreeMap::new()
        };
        tracing::debug!("Loaded {} history entries from {:?}", map.len(), path);
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.map).get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut map = lock(&self.map);
        map.insert(key.to_string(), value.to_string());
        let json = serde_json::to_string_pretty(&*map)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, json)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct ViewHistory {
    store: Arc<dyn KeyValueStore>,
}

impl ViewHistory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    fn key(item_id: &str) -> String {
        format!("viewed:{}", item_id)
    }

    pub fn mark_viewed(&self, item_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.store.put(&Self::key(item_id), &at.to_rfc3339())
    }

    /// Record a view on the blocking pool. Store failures are logged.
    pub fn spawn_mark_viewed(&self, item_id: &str, at: DateTime<Utc>) -> JoinHandle<()> {
        let history = self.clone();
        let item_id = item_id.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = history.mark_viewed(&item_id, at) {
                tracing::warn!("Failed to record view of {}: {}", item_id, e);
            }
        })
    }

    pub fn viewed_at(&self, item_id: &str) -> Option<DateTime<Utc>> {
        let raw = match self.store.get(&Self::key(item_id)) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!("Failed to read view history for {}: {}", item_id, e);
                return None;
            }
        };
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .ok()
    }

    /// Copy of `collection` with stored view times applied to items that
    /// carry none.
    pub fn apply(&self, collection: &Collection) -> Collection {
        let mut updated = collection.clone();
        for group in &mut updated.groups {
            for item in &mut group.items {
                if item.viewed_at.is_none() {
                    if let Some(at) = self.viewed_at(&item.id) {
                        *item = item.with_viewed_at(at);
                    }
                }
            }
        }
        updated
    }
}
