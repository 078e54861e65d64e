//! Error taxonomy for the cascade engine.
//!
//! `CacheError` is `Clone` so a single failure can fan out to every waiter
//! coalesced onto the same in-flight request.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// A tier resolver failed at the I/O boundary (durable store or worker
    /// pool). Fails every request in the affected batch.
    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable {
        tier: &'static str,
        reason: String,
    },

    /// No fetch executor became idle within the configured bounded wait.
    #[error("no idle fetch executor after {waited_ms} ms")]
    PoolExhausted { waited_ms: u64 },

    /// The request was shed under backpressure: its stage was saturated and
    /// the pending table exceeded its bound.
    #[error("request shed under backpressure at the {stage} stage")]
    Evicted { stage: &'static str },

    /// Rejected at construction time. Fatal: the engine never starts.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A resolution channel closed without delivering a result.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl CacheError {
    /// Helper for resolver-boundary failures.
    pub fn tier(tier: &'static str, err: impl std::fmt::Display) -> Self {
        Self::TierUnavailable {
            tier,
            reason: err.to_string(),
        }
    }
}
