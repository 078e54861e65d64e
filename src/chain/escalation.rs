//! Chain construction and chain entry.
//!
//! An `EscalationChain` is an ordered list of stages linked for promotion:
//! a miss at stage *i* moves the task to stage *i+1*. The chain also owns
//! the in-flight index, which gives it the coalescing entry point: a second
//! request for a key already being resolved attaches to the existing task
//! instead of starting another resolution.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::chain::stage::{ResolutionStage, StageLinks};
use crate::chain::task::{InflightIndex, Key, Task, TaskPayload, TaskResult};
use crate::error::CacheError;

/// An ordered sequence of stages with promotion links. A read chain and a
/// write chain are separate instances; all mutable state lives in the
/// stages and the in-flight index.
pub struct EscalationChain {
    label: &'static str,
    stages: Vec<Arc<ResolutionStage>>,
    index: Arc<InflightIndex>,
}

impl EscalationChain {
    /// Link the given stages into a chain. Each stage gets its promotion
    /// link, a weak link back to the head, and the chain's index. Stage
    /// configurations are validated here; a zero batch size or batch limit
    /// can never make progress.
    pub(crate) fn new(
        label: &'static str,
        stages: Vec<Arc<ResolutionStage>>,
    ) -> Result<Arc<Self>, CacheError> {
        if stages.is_empty() {
            return Err(CacheError::InvalidConfig(format!(
                "{label} chain has no stages"
            )));
        }
        let index = Arc::new(InflightIndex::default());
        for (idx, stage) in stages.iter().enumerate() {
            let cfg = stage.config();
            if cfg.batch_size == 0 || cfg.max_concurrent_batches == 0 {
                return Err(CacheError::InvalidConfig(format!(
                    "stage {} has a zero batch size or batch limit",
                    stage.label()
                )));
            }
            stage.set_links(StageLinks {
                idx,
                next: stages.get(idx + 1).cloned(),
                head: (idx > 0).then(|| Arc::downgrade(&stages[0])),
                index: index.clone(),
            })?;
        }
        Ok(Arc::new(Self {
            label,
            stages,
            index,
        }))
    }

    /// Enter the chain at stage 0, returning a receiver for the result.
    ///
    /// If a task for the key is already in flight anywhere in the chain,
    /// the caller is attached as an additional waiter. For writes the
    /// payload is additionally replaced (last write wins); a task that has
    /// already passed the head is marked to re-run from it, so the newest
    /// value still traverses the full path.
    pub(crate) fn submit(&self, key: Key, payload: TaskPayload) -> oneshot::Receiver<TaskResult> {
        let (tx, rx) = oneshot::channel();
        self.submit_inner(0, key, payload, Some(tx), true);
        rx
    }

    /// Enter the chain at an arbitrary stage with no waiter. Used for
    /// internal write traffic such as fast-tier eviction mirroring, which
    /// enters directly at the durable stage. A detached write yields to a
    /// live task for the same key: the live write is newer than anything
    /// the fast tier displaced.
    pub(crate) fn submit_detached(&self, stage_idx: usize, key: Key, payload: TaskPayload) {
        self.submit_inner(stage_idx, key, payload, None, false);
    }

    fn submit_inner(
        &self,
        stage_idx: usize,
        key: Key,
        payload: TaskPayload,
        waiter: Option<oneshot::Sender<TaskResult>>,
        replace_payload: bool,
    ) {
        let Some(entry_stage) = self.stages.get(stage_idx) else {
            if let Some(tx) = waiter {
                let _ = tx.send(Err(CacheError::Internal("no such stage in chain")));
            }
            return;
        };

        {
            let mut entries = self.index.entries.lock();
            if let Some(task) = entries.get(&key) {
                // Coalesce onto the live task. Attaching under the index
                // lock means the task cannot complete in between.
                let mut state = task.state.lock();
                if let Some(tx) = waiter {
                    state.waiters.push(tx);
                }
                if replace_payload {
                    if let TaskPayload::Write(value) = payload {
                        state.payload = TaskPayload::Write(value);
                        if state.processing || state.stage_idx > 0 {
                            state.dirty = true;
                        }
                    }
                }
                debug!(chain = self.label, key = %key, "coalesced onto in-flight task");
                return;
            }

            let task = Task::new(key.clone(), payload);
            if let Some(tx) = waiter {
                task.state.lock().waiters.push(tx);
            }
            entries.insert(key, task.clone());
            drop(entries);
            entry_stage.enqueue(task);
        }
    }

    /// Number of keys currently being resolved.
    pub fn in_flight(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn stages(&self) -> &[Arc<ResolutionStage>] {
        &self.stages
    }
}

impl std::fmt::Debug for EscalationChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationChain")
            .field("label", &self.label)
            .field("stages", &self.stages.len())
            .field("in_flight", &self.index.len())
            .finish()
    }
}
