use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use backdrop_contracts::store::KeyValueStore;
use indexmap::IndexSet;
use serde_json::Value;

pub const LEDGER_KEY_PREFIX: &str = "extraBgProcessedIds-";

/// Durable per-character record of chat turns that already produced a background.
///
/// Loading and saving are best-effort: a missing or corrupt entry reads as an
/// empty set and a failed save is logged, never propagated.
pub struct ProcessedLedger {
    store: Arc<dyn KeyValueStore>,
    sets: Mutex<HashMap<String, IndexSet<String>>>,
}

impl ProcessedLedger {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            sets: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage_key(character_id: &str) -> String {
        format!("{LEDGER_KEY_PREFIX}{character_id}")
    }

    /// Replaces the cached set with what durable storage holds.
    pub async fn load(&self, character_id: &str) {
        let ids = self.read_or_empty(character_id).await;
        self.sets().insert(character_id.to_string(), ids);
    }

    /// Loads only if this character has not been hydrated yet. A set cached
    /// by a concurrent load while this one was reading is kept as is.
    pub async fn ensure_loaded(&self, character_id: &str) {
        if self.is_loaded(character_id) {
            return;
        }
        let ids = self.read_or_empty(character_id).await;
        self.sets().entry(character_id.to_string()).or_insert(ids);
    }

    pub fn is_loaded(&self, character_id: &str) -> bool {
        self.sets().contains_key(character_id)
    }

    pub fn has(&self, character_id: &str, message_id: &str) -> bool {
        self.sets()
            .get(character_id)
            .map(|ids| ids.contains(message_id))
            .unwrap_or(false)
    }

    pub fn add(&self, character_id: &str, message_id: &str) {
        self.sets()
            .entry(character_id.to_string())
            .or_default()
            .insert(message_id.to_string());
    }

    pub fn ids(&self, character_id: &str) -> Vec<String> {
        self.sets()
            .get(character_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Persists the cached set. Returns whether the write went through.
    pub async fn save(&self, character_id: &str) -> bool {
        let Some(ids) = self.sets().get(character_id).cloned() else {
            return false;
        };
        let key = Self::storage_key(character_id);
        let payload = Value::Array(ids.into_iter().map(Value::String).collect());
        match self.store.set(&key, payload).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(character_id, error = %format!("{err:#}"), "failed to save processed-id ledger");
                false
            }
        }
    }

    pub async fn clear(&self, character_id: &str) -> bool {
        self.sets()
            .insert(character_id.to_string(), IndexSet::new());
        self.save(character_id).await
    }

    async fn read_or_empty(&self, character_id: &str) -> IndexSet<String> {
        match self.read(character_id).await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(character_id, error = %format!("{err:#}"), "processed-id ledger unreadable; starting empty");
                IndexSet::new()
            }
        }
    }

    async fn read(&self, character_id: &str) -> anyhow::Result<IndexSet<String>> {
        let key = Self::storage_key(character_id);
        let Some(value) = self.store.get(&key).await? else {
            return Ok(IndexSet::new());
        };
        let ids: Vec<String> = serde_json::from_value(value)
            .with_context(|| format!("ledger entry {key} is not a list of ids"))?;
        Ok(ids.into_iter().collect())
    }

    fn sets(&self) -> MutexGuard<'_, HashMap<String, IndexSet<String>>> {
        self.sets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
