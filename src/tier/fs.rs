//! File-backed durable store.
//!
//! One file per key under a two-level sharded directory layout, async I/O
//! via `tokio::fs`. Keys are hex-encoded into file names, so any string
//! key is representable regardless of path separators in it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use crate::chain::task::{Key, Value};
use crate::tier::store::DurableStore;

/// Durable store writing each value to its own file.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    stats: FsStoreStats,
}

#[derive(Debug, Default)]
pub struct FsStoreStats {
    pub total_reads: AtomicU64,
    pub total_writes: AtomicU64,
}

impl FsStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            stats: FsStoreStats::default(),
        })
    }

    /// File path for a key: `<root>/<shard>/<hex(key)>.val`, sharded so a
    /// large keyspace does not land in a single directory.
    fn entry_path(&self, key: &Key) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = hasher.finish() % 256;

        let mut name = String::with_capacity(key.len() * 2 + 4);
        for byte in key.as_bytes() {
            name.push_str(&format!("{byte:02x}"));
        }
        name.push_str(".val");

        self.root.join(format!("{shard:02x}")).join(name)
    }

    pub fn stats(&self) -> &FsStoreStats {
        &self.stats
    }
}

#[async_trait]
impl DurableStore for FsStore {
    async fn batch_get(&self, keys: &[Key]) -> anyhow::Result<Vec<Option<Value>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let path = self.entry_path(key);
            match fs::read(&path).await {
                Ok(data) => {
                    self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
                    values.push(Some(Bytes::from(data)));
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => values.push(None),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(values)
    }

    async fn batch_put(&self, entries: &[(Key, Value)]) -> anyhow::Result<()> {
        for (key, value) in entries {
            let path = self.entry_path(key);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, value).await?;
            self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, path = %path.display(), size = value.len(), "wrote entry");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::open(tmp.path().join("store")).await.unwrap();

        store
            .batch_put(&[("some/key".to_string(), Bytes::from("payload"))])
            .await
            .unwrap();

        let values = store
            .batch_get(&["some/key".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(values[0], Some(Bytes::from("payload")));
        assert_eq!(values[1], None);
        assert_eq!(store.stats().total_writes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::open(tmp.path().join("store")).await.unwrap();

        store
            .batch_put(&[("k".to_string(), Bytes::from("old"))])
            .await
            .unwrap();
        store
            .batch_put(&[("k".to_string(), Bytes::from("new"))])
            .await
            .unwrap();

        let values = store.batch_get(&["k".to_string()]).await.unwrap();
        assert_eq!(values[0], Some(Bytes::from("new")));
    }
}
