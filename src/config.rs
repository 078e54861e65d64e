//! Runtime configuration for lookup-cascade.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All knobs are fixed at construction; there is no live
//! reconfiguration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Fast-tier capacity in entries.
    pub fast: FastConfig,

    /// Worker pool for origin fetches.
    pub pool: PoolConfig,

    /// Read chain stages, fastest first.
    pub read: ReadChainConfig,

    /// Write chain stages.
    pub write: WriteChainConfig,
}

/// Fast-tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastConfig {
    /// Maximum number of entries before LRU eviction.
    pub capacity: usize,
}

impl Default for FastConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of fetch executors.
    pub size: usize,

    /// Bounded wait for an idle executor in milliseconds; `None` waits
    /// indefinitely.
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            acquire_timeout_ms: None,
        }
    }
}

/// One stage's batching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Maximum keys per resolver batch.
    pub batch_size: usize,

    /// Maximum batches in flight at once.
    pub max_concurrent_batches: usize,

    /// Stragglers below batch size are flushed after this interval.
    pub idle_flush_interval_ms: u64,
}

impl StageConfig {
    pub fn idle_flush_interval(&self) -> Duration {
        Duration::from_millis(self.idle_flush_interval_ms)
    }

    fn validate(&self, stage: &str) -> Result<(), CacheError> {
        if self.batch_size == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "{stage}: batch_size must be at least 1"
            )));
        }
        if self.max_concurrent_batches == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "{stage}: max_concurrent_batches must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Read chain stage settings, fastest tier first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadChainConfig {
    pub fast: StageConfig,
    pub durable: StageConfig,
    pub origin: StageConfig,
}

impl Default for ReadChainConfig {
    fn default() -> Self {
        Self {
            fast: StageConfig {
                batch_size: 32,
                max_concurrent_batches: 50,
                idle_flush_interval_ms: 10,
            },
            durable: StageConfig {
                batch_size: 16,
                max_concurrent_batches: 15,
                idle_flush_interval_ms: 100,
            },
            origin: StageConfig {
                batch_size: 8,
                max_concurrent_batches: 5,
                idle_flush_interval_ms: 200,
            },
        }
    }
}

/// Write chain stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteChainConfig {
    pub fast: StageConfig,
    pub durable: StageConfig,
}

impl Default for WriteChainConfig {
    fn default() -> Self {
        Self {
            fast: StageConfig {
                batch_size: 32,
                max_concurrent_batches: 50,
                idle_flush_interval_ms: 10,
            },
            durable: StageConfig {
                batch_size: 16,
                max_concurrent_batches: 15,
                idle_flush_interval_ms: 100,
            },
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject configurations the engine cannot run with. Construction
    /// errors are fatal.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.fast.capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "fast.capacity must be at least 1".to_string(),
            ));
        }
        if self.pool.size == 0 {
            return Err(CacheError::InvalidConfig(
                "pool.size must be at least 1".to_string(),
            ));
        }
        self.read.fast.validate("read.fast")?;
        self.read.durable.validate("read.durable")?;
        self.read.origin.validate("read.origin")?;
        self.write.fast.validate("write.fast")?;
        self.write.durable.validate("write.durable")?;
        Ok(())
    }
}
