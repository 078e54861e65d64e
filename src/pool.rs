//! Bounded parallel-fetch worker pool.
//!
//! A fixed set of fetch executors sits behind an idle queue. Acquisition
//! suspends on the queue — no retry loops — and a release wakes exactly one
//! waiter. The transport behind an executor is out of scope; only the
//! batch request/response contract matters.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::chain::task::{Key, Value};
use crate::config::PoolConfig;
use crate::error::CacheError;

/// A fetch executor: answers one batch job at a time.
///
/// The response must align to the request by position — exactly one entry
/// per submitted key, in the submitted order.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, keys: &[Key]) -> anyhow::Result<Vec<Option<Value>>>;
}

/// Factory for fetch executors; also used to replace a failed one.
pub type FetcherFactory = Box<dyn Fn() -> Box<dyn Fetcher> + Send + Sync>;

/// Fixed-size pool of fetch executors.
pub struct WorkerPool {
    size: usize,
    idle_tx: mpsc::UnboundedSender<Box<dyn Fetcher>>,
    idle_rx: Mutex<mpsc::UnboundedReceiver<Box<dyn Fetcher>>>,
    spawn: FetcherFactory,
    acquire_timeout: Option<Duration>,
}

impl WorkerPool {
    /// Spawn `cfg.size` executors up front.
    pub fn new(cfg: &PoolConfig, spawn: FetcherFactory) -> Result<Self, CacheError> {
        if cfg.size == 0 {
            return Err(CacheError::InvalidConfig(
                "worker pool size must be at least 1".to_string(),
            ));
        }
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        for _ in 0..cfg.size {
            let _ = idle_tx.send(spawn());
        }
        Ok(Self {
            size: cfg.size,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            spawn,
            acquire_timeout: cfg.acquire_timeout_ms.map(Duration::from_millis),
        })
    }

    /// Check out an idle executor, suspending until one is available or the
    /// configured bounded wait elapses.
    async fn acquire(&self) -> Result<Box<dyn Fetcher>, CacheError> {
        let mut idle = self.idle_rx.lock().await;
        let executor = match self.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, idle.recv())
                .await
                .map_err(|_| CacheError::PoolExhausted {
                    waited_ms: limit.as_millis() as u64,
                })?,
            None => idle.recv().await,
        };
        // The pool holds its own sender, so the channel cannot close.
        executor.ok_or(CacheError::Internal("executor queue closed"))
    }

    fn release(&self, executor: Box<dyn Fetcher>) {
        let _ = self.idle_tx.send(executor);
    }

    /// Run one batch job: acquire → submit → release.
    ///
    /// A failed executor is not returned to the pool; a freshly spawned
    /// replacement takes its slot, so capacity is never permanently lost.
    pub async fn fetch(&self, keys: &[Key]) -> Result<Vec<Option<Value>>, CacheError> {
        let executor = self.acquire().await?;
        match executor.fetch(keys).await {
            Ok(values) if values.len() == keys.len() => {
                debug!(keys = keys.len(), "fetch batch complete");
                self.release(executor);
                Ok(values)
            }
            Ok(values) => {
                self.release(executor);
                Err(CacheError::tier(
                    "origin",
                    format!("executor answered {} of {} keys", values.len(), keys.len()),
                ))
            }
            Err(err) => {
                warn!(error = %err, "fetch executor failed, spawning replacement");
                self.release((self.spawn)());
                Err(CacheError::tier("origin", err))
            }
        }
    }

    /// Number of executors the pool was built with.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}
