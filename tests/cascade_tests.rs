//! End-to-end tests for the read and write cascades.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use lookup_cascade::{
    CacheError, CascadeCache, Config, DurableStore, Fetcher, FetcherFactory, FsStore, Key,
    MemoryStore, Value,
};

/// Answers from a fixed map, counting batch invocations.
struct MapFetcher {
    answers: HashMap<Key, Value>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Fetcher for MapFetcher {
    async fn fetch(&self, keys: &[Key]) -> anyhow::Result<Vec<Option<Value>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(keys.iter().map(|k| self.answers.get(k).cloned()).collect())
    }
}

fn map_fetcher(answers: &[(&str, &str)]) -> (FetcherFactory, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let answers: HashMap<Key, Value> = answers
        .iter()
        .map(|(k, v)| (k.to_string(), Bytes::copy_from_slice(v.as_bytes())))
        .collect();
    let counter = calls.clone();
    let factory: FetcherFactory = Box::new(move || {
        Box::new(MapFetcher {
            answers: answers.clone(),
            calls: counter.clone(),
        }) as Box<dyn Fetcher>
    });
    (factory, calls)
}

/// Delegates to a `MemoryStore`, recording every key that reaches
/// `batch_put`.
struct RecordingStore {
    inner: MemoryStore,
    put_keys: parking_lot::Mutex<Vec<Key>>,
}

impl RecordingStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            put_keys: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn put_keys(&self) -> Vec<Key> {
        self.put_keys.lock().clone()
    }
}

#[async_trait]
impl DurableStore for RecordingStore {
    async fn batch_get(&self, keys: &[Key]) -> anyhow::Result<Vec<Option<Value>>> {
        self.inner.batch_get(keys).await
    }

    async fn batch_put(&self, entries: &[(Key, Value)]) -> anyhow::Result<()> {
        self.put_keys
            .lock()
            .extend(entries.iter().map(|(k, _)| k.clone()));
        self.inner.batch_put(entries).await
    }
}

/// Short flush intervals so straggler batches run promptly under test.
fn test_config() -> Config {
    let mut config = Config::default();
    config.read.fast.idle_flush_interval_ms = 5;
    config.read.durable.idle_flush_interval_ms = 5;
    config.read.origin.idle_flush_interval_ms = 5;
    config.write.fast.idle_flush_interval_ms = 5;
    config.write.durable.idle_flush_interval_ms = 5;
    config
}

async fn eventually(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_durable_hit_promotes_into_fast_tier() {
    let store = Arc::new(MemoryStore::new());
    store.seed("k", Bytes::from("v")).await;
    let (factory, origin_calls) = map_fetcher(&[]);
    let cache = CascadeCache::new(test_config(), store, factory).unwrap();

    let value = cache.get("k").await.unwrap();
    assert_eq!(value, Some(Bytes::from("v")));

    // The hit was written back into the fast tier before the caller saw it.
    assert!(cache.fast_contains("k"));
    // The durable tier answered; the origin was never consulted.
    assert_eq!(origin_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_full_miss_populates_both_tiers() {
    let store = RecordingStore::new();
    let (factory, origin_calls) = map_fetcher(&[("k", "v")]);
    let cache = CascadeCache::new(test_config(), store.clone(), factory).unwrap();

    let value = cache.get("k").await.unwrap();
    assert_eq!(value, Some(Bytes::from("v")));
    assert_eq!(origin_calls.load(Ordering::SeqCst), 1);
    assert!(cache.fast_contains("k"));

    // The origin result is mirrored to the durable tier asynchronously.
    assert!(
        eventually(1_000, || !store.put_keys().is_empty()).await,
        "origin result never reached the durable tier"
    );
    assert_eq!(store.inner.get("k").await, Some(Bytes::from("v")));
}

#[tokio::test]
async fn test_absent_everywhere_resolves_none() {
    let store = Arc::new(MemoryStore::new());
    let (factory, _) = map_fetcher(&[]);
    let cache = CascadeCache::new(test_config(), store.clone(), factory).unwrap();

    assert_eq!(cache.get("ghost").await.unwrap(), None);
    assert!(!cache.fast_contains("ghost"));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_set_acks_after_durable_persist() {
    let store = Arc::new(MemoryStore::new());
    let (factory, _) = map_fetcher(&[]);
    let cache = CascadeCache::new(test_config(), store.clone(), factory).unwrap();

    cache.set("k", Bytes::from("v")).await.unwrap();

    // By ack time the value is in both tiers.
    assert!(cache.fast_contains("k"));
    assert_eq!(store.get("k").await, Some(Bytes::from("v")));
}

#[tokio::test]
async fn test_fast_tier_eviction_is_mirrored_to_durable() {
    let store = RecordingStore::new();
    let (factory, _) = map_fetcher(&[]);
    let mut config = test_config();
    config.fast.capacity = 2;
    let cache = CascadeCache::new(config, store.clone(), factory).unwrap();

    cache.set("a", Bytes::from("1")).await.unwrap();
    cache.set("b", Bytes::from("2")).await.unwrap();
    let baseline = store.put_keys().len();

    // "a" is the LRU entry; inserting "c" displaces it, and the displaced
    // value re-enters the write chain at the durable stage.
    cache.set("c", Bytes::from("3")).await.unwrap();
    assert!(!cache.fast_contains("a"));
    assert!(cache.fast_contains("b"));
    assert!(cache.fast_contains("c"));

    assert!(
        eventually(1_000, || {
            store.put_keys().len() > baseline + 1
                && store.put_keys().iter().skip(baseline).any(|k| k == "a")
        })
        .await,
        "evicted entry never reached the durable tier"
    );
}

#[tokio::test]
async fn test_get_many_aligns_results_to_keys() {
    let store = Arc::new(MemoryStore::new());
    store.seed("stored", Bytes::from("s")).await;
    let (factory, _) = map_fetcher(&[("fetched", "f")]);
    let cache = CascadeCache::new(test_config(), store, factory).unwrap();

    let keys: Vec<Key> = vec![
        "stored".to_string(),
        "fetched".to_string(),
        "absent".to_string(),
    ];
    let results = cache.get_many(&keys).await;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap(), &Some(Bytes::from("s")));
    assert_eq!(results[1].as_ref().unwrap(), &Some(Bytes::from("f")));
    assert_eq!(results[2].as_ref().unwrap(), &None);
}

#[tokio::test]
async fn test_store_failure_surfaces_to_writer() {
    struct BrokenStore;

    #[async_trait]
    impl DurableStore for BrokenStore {
        async fn batch_get(&self, keys: &[Key]) -> anyhow::Result<Vec<Option<Value>>> {
            Ok(keys.iter().map(|_| None).collect())
        }

        async fn batch_put(&self, _entries: &[(Key, Value)]) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    let (factory, _) = map_fetcher(&[]);
    let cache = CascadeCache::new(test_config(), Arc::new(BrokenStore), factory).unwrap();

    let err = cache.set("k", Bytes::from("v")).await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::TierUnavailable { tier: "durable", .. }
    ));
}

#[tokio::test]
async fn test_cascade_over_fs_store() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(FsStore::open(tmp.path().join("store")).await.unwrap());
    let (factory, _) = map_fetcher(&[]);
    let cache = CascadeCache::new(test_config(), store.clone(), factory).unwrap();

    cache.set("path/to/key", Bytes::from("payload")).await.unwrap();

    let direct = store
        .batch_get(&["path/to/key".to_string()])
        .await
        .unwrap();
    assert_eq!(direct[0], Some(Bytes::from("payload")));

    // A cold engine over the same directory reads the value back through
    // the durable stage.
    let store = Arc::new(FsStore::open(tmp.path().join("store")).await.unwrap());
    let (factory, _) = map_fetcher(&[]);
    let cold = CascadeCache::new(test_config(), store, factory).unwrap();
    assert_eq!(
        cold.get("path/to/key").await.unwrap(),
        Some(Bytes::from("payload"))
    );
}
