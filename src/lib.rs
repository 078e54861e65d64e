//! lookup-cascade: a multi-tier escalating lookup cache.
//!
//! A key escalates through tiers of increasing cost:
//!   fast in-process LRU (hot) → durable store (warm) → origin fetch via a
//!   bounded worker pool (cold)
//!
//! Each tier batches concurrent lookups, promotes misses to the next tier,
//! and writes resolved values back into faster tiers. Writes update the
//! fast tier immediately and are mirrored to the durable tier
//! asynchronously, including values displaced from the fast tier under
//! memory pressure.
//!
//! The engine is constructed explicitly and handed to consumers:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use lookup_cascade::{CascadeCache, Config, Fetcher, Key, MemoryStore, Value};
//!
//! struct OriginFetcher;
//!
//! #[async_trait::async_trait]
//! impl Fetcher for OriginFetcher {
//!     async fn fetch(&self, keys: &[Key]) -> anyhow::Result<Vec<Option<Value>>> {
//!         // One response per key, in key order.
//!         Ok(keys.iter().map(|_| Some(Bytes::from("fetched"))).collect())
//!     }
//! }
//!
//! # async fn run() -> Result<(), lookup_cascade::CacheError> {
//! let cache = CascadeCache::new(
//!     Config::default(),
//!     Arc::new(MemoryStore::new()),
//!     Box::new(|| Box::new(OriginFetcher)),
//! )?;
//!
//! cache.set("greeting", Bytes::from("hello")).await?;
//! let value = cache.get("greeting").await?;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod tier;

pub use chain::stage::{BatchItem, BatchResolver, StageDepth};
pub use chain::task::{Key, TaskPayload, TaskResult, Value};
pub use config::{Config, FastConfig, PoolConfig, ReadChainConfig, StageConfig, WriteChainConfig};
pub use engine::CascadeCache;
pub use error::CacheError;
pub use pool::{Fetcher, FetcherFactory, WorkerPool};
pub use tier::fast::{FastCache, LruFastCache};
pub use tier::fs::FsStore;
pub use tier::store::{DurableStore, MemoryStore};
