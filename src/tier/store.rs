//! The durable tier: order-preserving batch get/put.
//!
//! Implementations answer each batch with one entry per requested key, in
//! the requested order. Errors cross the boundary as `anyhow::Error`; the
//! owning resolver maps them to `CacheError::TierUnavailable`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::chain::task::{Key, Value};

/// Durable key/value storage.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Look up a batch of keys. The response preserves key order: entry
    /// *i* answers `keys[i]`.
    async fn batch_get(&self, keys: &[Key]) -> anyhow::Result<Vec<Option<Value>>>;

    /// Persist a batch of entries.
    async fn batch_put(&self, entries: &[(Key, Value)]) -> anyhow::Result<()>;
}

/// In-memory durable store. The default collaborator for tests and for
/// embedding without a persistence layer.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<Key, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate an entry, bypassing the engine.
    pub async fn seed(&self, key: impl Into<Key>, value: Value) {
        self.entries.write().await.insert(key.into(), value);
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn batch_get(&self, keys: &[Key]) -> anyhow::Result<Vec<Option<Value>>> {
        let entries = self.entries.read().await;
        Ok(keys.iter().map(|key| entries.get(key).cloned()).collect())
    }

    async fn batch_put(&self, batch: &[(Key, Value)]) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        for (key, value) in batch {
            entries.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}
