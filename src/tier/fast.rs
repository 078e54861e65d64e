//! The fast tier: a capacity-bounded in-process cache.
//!
//! The engine only relies on the `FastCache` contract; the reference
//! implementation is a strict LRU. Evictions are returned from `put` so
//! the caller can mirror displaced values into the durable tier.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::chain::task::{Key, Value};
use crate::error::CacheError;

/// Capacity-bounded keyed cache.
pub trait FastCache: Send {
    /// Look up a key, refreshing its recency.
    fn get(&mut self, key: &str) -> Option<Value>;

    /// Insert a value, returning any entries evicted to make room. A
    /// same-key overwrite is not an eviction.
    fn put(&mut self, key: Key, value: Value) -> Vec<(Key, Value)>;

    /// Whether a key is present, without touching recency.
    fn contains(&self, key: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    fn capacity(&self) -> usize;
}

/// Strict least-recently-used cache over the `lru` crate.
pub struct LruFastCache {
    inner: LruCache<Key, Value>,
}

impl LruFastCache {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            CacheError::InvalidConfig("fast cache capacity must be at least 1".to_string())
        })?;
        Ok(Self {
            inner: LruCache::new(capacity),
        })
    }
}

impl FastCache for LruFastCache {
    fn get(&mut self, key: &str) -> Option<Value> {
        self.inner.get(key).cloned()
    }

    fn put(&mut self, key: Key, value: Value) -> Vec<(Key, Value)> {
        match self.inner.push(key.clone(), value) {
            // `push` also reports a same-key replacement; only a different
            // key is a true eviction.
            Some((evicted_key, evicted_value)) if evicted_key != key => {
                vec![(evicted_key, evicted_value)]
            }
            _ => Vec::new(),
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.inner.contains(key)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn capacity(&self) -> usize {
        self.inner.cap().get()
    }
}
