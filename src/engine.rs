//! The cascade facade: wires the tiers into read and write chains.
//!
//! Read path: fast cache → durable store → origin fetch via the worker
//! pool, with misses promoted stage to stage and results written back into
//! faster tiers. Write path: the fast tier is updated first, then the
//! value escalates to the durable stage, which persists it and acks the
//! caller. Values displaced from the fast tier re-enter the write chain at
//! the durable stage.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use crate::chain::escalation::EscalationChain;
use crate::chain::stage::{BatchItem, BatchResolver, HitHook, ResolutionStage, StageDepth};
use crate::chain::task::{Key, TaskPayload, TaskResult, Value};
use crate::config::Config;
use crate::error::CacheError;
use crate::pool::{FetcherFactory, WorkerPool};
use crate::tier::fast::{FastCache, LruFastCache};
use crate::tier::store::DurableStore;

/// Position of the durable stage in the write chain; internal write
/// traffic (eviction mirroring, origin write-back) enters here.
const DURABLE_WRITE_STAGE: usize = 1;

type SharedFast = Arc<Mutex<Box<dyn FastCache>>>;
type MirrorSender = mpsc::UnboundedSender<(Key, Value)>;

/// Public get/set surface over the escalation chains.
pub struct CascadeCache {
    read: Arc<EscalationChain>,
    write: Arc<EscalationChain>,
    fast: SharedFast,
    pool: Arc<WorkerPool>,
}

impl CascadeCache {
    /// Build the engine from a validated configuration, a durable store,
    /// and a fetch-executor factory. Must be called inside a Tokio
    /// runtime: stage timers and the mirror forwarder are spawned on it.
    pub fn new(
        config: Config,
        store: Arc<dyn DurableStore>,
        spawn: FetcherFactory,
    ) -> Result<Self, CacheError> {
        config.validate()?;

        let lru: Box<dyn FastCache> = Box::new(LruFastCache::new(config.fast.capacity)?);
        let fast: SharedFast = Arc::new(Mutex::new(lru));
        let pool = Arc::new(WorkerPool::new(&config.pool, spawn)?);
        let (mirror_tx, mut mirror_rx) = mpsc::unbounded_channel();

        let write = EscalationChain::new(
            "write",
            vec![
                ResolutionStage::new(
                    "fast-write",
                    config.write.fast.clone(),
                    Arc::new(FastWriteResolver {
                        fast: fast.clone(),
                        mirror: mirror_tx.clone(),
                    }),
                    None,
                ),
                ResolutionStage::new(
                    "durable-write",
                    config.write.durable.clone(),
                    Arc::new(DurableWriteResolver {
                        store: store.clone(),
                    }),
                    None,
                ),
            ],
        )?;

        // Write-back hooks for the read chain: a durable hit fills the
        // fast tier; an origin hit additionally flows to the durable tier.
        let durable_fill: HitHook = {
            let fast = fast.clone();
            let mirror = mirror_tx.clone();
            Arc::new(move |key: &Key, value: &Value| {
                fill_fast(&fast, &mirror, key, value);
            })
        };
        let origin_fill: HitHook = {
            let fast = fast.clone();
            let mirror = mirror_tx.clone();
            Arc::new(move |key: &Key, value: &Value| {
                fill_fast(&fast, &mirror, key, value);
                let _ = mirror.send((key.clone(), value.clone()));
            })
        };

        let read = EscalationChain::new(
            "read",
            vec![
                ResolutionStage::new(
                    "fast",
                    config.read.fast.clone(),
                    Arc::new(FastReadResolver { fast: fast.clone() }),
                    None,
                ),
                ResolutionStage::new(
                    "durable",
                    config.read.durable.clone(),
                    Arc::new(DurableReadResolver { store }),
                    Some(durable_fill),
                ),
                ResolutionStage::new(
                    "origin",
                    config.read.origin.clone(),
                    Arc::new(OriginResolver { pool: pool.clone() }),
                    Some(origin_fill),
                ),
            ],
        )?;

        // Mirror forwarder: displaced fast-tier values and origin results
        // become write tasks at the durable stage. Enqueueing arms the
        // stage's scheduler like any other enqueue. The loop ends once
        // every mirror sender is gone.
        {
            let write = write.clone();
            tokio::spawn(async move {
                while let Some((key, value)) = mirror_rx.recv().await {
                    write.submit_detached(DURABLE_WRITE_STAGE, key, TaskPayload::Write(value));
                }
            });
        }

        info!(
            fast_capacity = config.fast.capacity,
            pool_size = pool.size(),
            "cascade constructed"
        );

        Ok(Self {
            read,
            write,
            fast,
            pool,
        })
    }

    /// Look up a key through the read chain. Suspends until the key
    /// resolves, fails, or is shed under backpressure. `Ok(None)` means no
    /// tier knows the key.
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Value>, CacheError> {
        let rx = self.read.submit(key.into(), TaskPayload::Read);
        flatten(rx.await)
    }

    /// Look up many keys, entering the chain together so they can share
    /// batches. Results align to `keys` by position.
    pub async fn get_many(&self, keys: &[Key]) -> Vec<Result<Option<Value>, CacheError>> {
        let receivers: Vec<_> = keys
            .iter()
            .map(|key| self.read.submit(key.clone(), TaskPayload::Read))
            .collect();
        futures::future::join_all(receivers.into_iter().map(|rx| async { flatten(rx.await) })).await
    }

    /// Write a value: the fast tier is updated on the way through the
    /// write chain, and the call acks once the durable tier has persisted
    /// the value.
    pub async fn set(&self, key: impl Into<Key>, value: Value) -> Result<(), CacheError> {
        let rx = self.write.submit(key.into(), TaskPayload::Write(value));
        flatten(rx.await).map(|_| ())
    }

    /// Whether the fast tier currently holds a key. Does not touch
    /// recency.
    pub fn fast_contains(&self, key: &str) -> bool {
        self.fast.lock().contains(key)
    }

    /// Number of entries in the fast tier.
    pub fn fast_len(&self) -> usize {
        self.fast.lock().len()
    }

    /// Depth snapshots of the read chain stages, fastest first.
    pub fn read_depths(&self) -> Vec<StageDepth> {
        self.read.stages().iter().map(|s| s.depth()).collect()
    }

    /// Depth snapshots of the write chain stages.
    pub fn write_depths(&self) -> Vec<StageDepth> {
        self.write.stages().iter().map(|s| s.depth()).collect()
    }

    /// Keys currently being resolved, per chain: `(reads, writes)`.
    pub fn in_flight(&self) -> (usize, usize) {
        (self.read.in_flight(), self.write.in_flight())
    }
}

impl std::fmt::Debug for CascadeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascadeCache")
            .field("fast_len", &self.fast_len())
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

fn flatten(received: Result<TaskResult, tokio::sync::oneshot::error::RecvError>) -> TaskResult {
    match received {
        Ok(result) => result,
        Err(_) => Err(CacheError::Internal("resolution channel closed")),
    }
}

/// Fill the fast tier and mirror anything it displaces.
fn fill_fast(fast: &SharedFast, mirror: &MirrorSender, key: &Key, value: &Value) {
    let evicted = fast.lock().put(key.clone(), value.clone());
    for entry in evicted {
        let _ = mirror.send(entry);
    }
}

struct FastReadResolver {
    fast: SharedFast,
}

#[async_trait]
impl BatchResolver for FastReadResolver {
    fn tier(&self) -> &'static str {
        "fast"
    }

    async fn resolve(&self, batch: &[BatchItem]) -> Result<Vec<Option<Value>>, CacheError> {
        let mut fast = self.fast.lock();
        Ok(batch.iter().map(|item| fast.get(&item.key)).collect())
    }
}

struct DurableReadResolver {
    store: Arc<dyn DurableStore>,
}

#[async_trait]
impl BatchResolver for DurableReadResolver {
    fn tier(&self) -> &'static str {
        "durable"
    }

    async fn resolve(&self, batch: &[BatchItem]) -> Result<Vec<Option<Value>>, CacheError> {
        let keys: Vec<Key> = batch.iter().map(|item| item.key.clone()).collect();
        self.store
            .batch_get(&keys)
            .await
            .map_err(|err| CacheError::tier("durable", err))
    }
}

struct OriginResolver {
    pool: Arc<WorkerPool>,
}

#[async_trait]
impl BatchResolver for OriginResolver {
    fn tier(&self) -> &'static str {
        "origin"
    }

    async fn resolve(&self, batch: &[BatchItem]) -> Result<Vec<Option<Value>>, CacheError> {
        let keys: Vec<Key> = batch.iter().map(|item| item.key.clone()).collect();
        self.pool.fetch(&keys).await
    }
}

/// Write stage 0: update the fast tier, then report every key unresolved
/// so the task escalates to the durable stage.
struct FastWriteResolver {
    fast: SharedFast,
    mirror: MirrorSender,
}

#[async_trait]
impl BatchResolver for FastWriteResolver {
    fn tier(&self) -> &'static str {
        "fast"
    }

    async fn resolve(&self, batch: &[BatchItem]) -> Result<Vec<Option<Value>>, CacheError> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for item in batch {
            if let TaskPayload::Write(value) = &item.payload {
                let evicted = self.fast.lock().put(item.key.clone(), value.clone());
                for entry in evicted {
                    let _ = self.mirror.send(entry);
                }
            }
            outcomes.push(None);
        }
        Ok(outcomes)
    }
}

/// Terminal write stage: persist the batch and ack each task with its
/// written value.
struct DurableWriteResolver {
    store: Arc<dyn DurableStore>,
}

#[async_trait]
impl BatchResolver for DurableWriteResolver {
    fn tier(&self) -> &'static str {
        "durable"
    }

    async fn resolve(&self, batch: &[BatchItem]) -> Result<Vec<Option<Value>>, CacheError> {
        let entries: Vec<(Key, Value)> = batch
            .iter()
            .filter_map(|item| match &item.payload {
                TaskPayload::Write(value) => Some((item.key.clone(), value.clone())),
                TaskPayload::Read => None,
            })
            .collect();
        self.store
            .batch_put(&entries)
            .await
            .map_err(|err| CacheError::tier("durable", err))?;
        Ok(batch
            .iter()
            .map(|item| match &item.payload {
                TaskPayload::Write(value) => Some(value.clone()),
                TaskPayload::Read => None,
            })
            .collect())
    }
}
