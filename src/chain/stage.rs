//! One tier's admission queue and batch scheduler.
//!
//! A `ResolutionStage` holds pending tasks for a tier, groups them into
//! batches, and hands each batch to the tier's resolver. A resolved key
//! completes every waiter; an unresolved key is promoted to the next stage.
//! When the stage is saturated, excess pending tasks are shed with an
//! explicit error rather than queued without bound.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::chain::task::{InflightIndex, Key, TaskPayload, TaskRef, Value};
use crate::config::StageConfig;
use crate::error::CacheError;

/// One entry of a batch handed to a resolver.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub key: Key,
    /// Snapshot of the task payload at selection time.
    pub payload: TaskPayload,
}

/// A tier's attempt to satisfy a batch of keys.
#[async_trait]
pub trait BatchResolver: Send + Sync {
    /// Tier label used in logs and errors.
    fn tier(&self) -> &'static str;

    /// Resolve a batch. Returns one outcome per item, in item order:
    /// `Some(value)` resolves the item, `None` sends it to the next stage
    /// (or resolves it absent at the terminal stage). An `Err` fails every
    /// item in the batch; partial success is not assumed.
    async fn resolve(&self, batch: &[BatchItem]) -> Result<Vec<Option<Value>>, CacheError>;
}

/// Invoked on a hit before the task completes, with the resolved value.
/// Used for write-back into faster tiers.
pub(crate) type HitHook = Arc<dyn Fn(&Key, &Value) + Send + Sync>;

/// Links set once when the stage is placed into a chain.
#[derive(Debug)]
pub(crate) struct StageLinks {
    /// Position of this stage in its chain.
    pub idx: usize,
    /// Next stage for promotion; `None` at the terminal stage.
    pub next: Option<Arc<ResolutionStage>>,
    /// Chain head, for re-running superseded writes. `None` at the head
    /// itself (a stage re-enqueues to itself in that case).
    pub head: Option<Weak<ResolutionStage>>,
    /// The owning chain's in-flight index.
    pub index: Arc<InflightIndex>,
}

/// Pending-table entry: the task plus its arrival order at this stage.
struct PendingEntry {
    task: TaskRef,
    seq: u64,
}

#[derive(Default)]
struct StageState {
    pending: HashMap<Key, PendingEntry>,
    /// Monotonic arrival counter; assigns `PendingEntry::seq`.
    arrivals: u64,
    /// Number of batches currently in flight (0..=max_concurrent_batches).
    in_flight: usize,
    /// Invalidates previously armed flush timers.
    timer_gen: u64,
}

/// Depth snapshot for monitoring.
#[derive(Debug, Clone)]
pub struct StageDepth {
    pub stage: &'static str,
    /// All pending tasks, including those in flight.
    pub pending: usize,
    /// Pending tasks not yet selected into a batch.
    pub ready: usize,
    pub in_flight_batches: usize,
}

/// A tier's batching unit.
pub struct ResolutionStage {
    label: &'static str,
    cfg: StageConfig,
    resolver: Arc<dyn BatchResolver>,
    on_hit: Option<HitHook>,
    links: OnceLock<StageLinks>,
    state: Mutex<StageState>,
}

impl ResolutionStage {
    pub(crate) fn new(
        label: &'static str,
        cfg: StageConfig,
        resolver: Arc<dyn BatchResolver>,
        on_hit: Option<HitHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            label,
            cfg,
            resolver,
            on_hit,
            links: OnceLock::new(),
            state: Mutex::new(StageState::default()),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub(crate) fn config(&self) -> &StageConfig {
        &self.cfg
    }

    pub(crate) fn set_links(&self, links: StageLinks) -> Result<(), CacheError> {
        self.links.set(links).map_err(|_| {
            CacheError::InvalidConfig(format!("stage {} already linked into a chain", self.label))
        })
    }

    /// Insert a task into the pending table and arm the scheduler.
    ///
    /// Every enqueue arms — caller-originated, promotion, write re-entry,
    /// and internal eviction notifications alike.
    pub(crate) fn enqueue(self: &Arc<Self>, task: TaskRef) {
        let Some(links) = self.links.get() else {
            return;
        };
        {
            let mut st = self.state.lock();
            st.arrivals += 1;
            let seq = st.arrivals;
            {
                let mut ts = task.state.lock();
                ts.stage_idx = links.idx;
            }
            st.pending
                .insert(task.key.clone(), PendingEntry { task, seq });
        }
        self.arm();
    }

    /// Idempotent scheduler tick: runs the pump immediately when a full
    /// batch of ready tasks is waiting, and (re)arms a single-shot flush
    /// timer so stragglers below batch size are eventually served. A newer
    /// arm supersedes any timer still pending.
    pub(crate) fn arm(self: &Arc<Self>) {
        let (run_now, gen) = {
            let mut st = self.state.lock();
            st.timer_gen += 1;
            (Self::ready(&st).len() >= self.cfg.batch_size, st.timer_gen)
        };

        if run_now {
            self.pump();
        }

        let stage = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(stage.cfg.idle_flush_interval()).await;
            let still_current = stage.state.lock().timer_gen == gen;
            if still_current {
                stage.pump();
            }
        });
    }

    fn ready(st: &StageState) -> Vec<(u64, TaskRef)> {
        st.pending
            .values()
            .filter(|entry| !entry.task.state.lock().processing)
            .map(|entry| (entry.seq, entry.task.clone()))
            .collect()
    }

    /// Dispatch batches while capacity allows; shed excess load when
    /// saturated. Each dispatched batch runs as its own task, so up to
    /// `max_concurrent_batches` resolver calls overlap.
    fn pump(self: &Arc<Self>) {
        let Some(links) = self.links.get() else {
            return;
        };
        loop {
            let mut st = self.state.lock();
            let mut ready = Self::ready(&st);
            if ready.is_empty() {
                return;
            }

            if st.in_flight >= self.cfg.max_concurrent_batches {
                // Saturated: bound the waiting set, shedding the oldest.
                let bound = self.cfg.batch_size * self.cfg.max_concurrent_batches;
                if ready.len() <= bound {
                    return;
                }
                ready.sort_unstable_by_key(|(seq, _)| *seq);
                let excess = ready.len() - bound;
                let victims: Vec<TaskRef> = ready
                    .into_iter()
                    .take(excess)
                    .filter_map(|(_, task)| st.pending.remove(&task.key))
                    .map(|entry| entry.task)
                    .collect();
                drop(st);

                warn!(
                    stage = self.label,
                    shed = victims.len(),
                    bound,
                    "stage saturated, shedding oldest pending requests"
                );
                for task in victims {
                    links
                        .index
                        .force_complete(&task, Err(CacheError::Evicted { stage: self.label }));
                }
                return;
            }

            // Selection is LIFO by arrival: the newest demand is served
            // first, and the oldest entries are the first shed under
            // backpressure.
            ready.sort_unstable_by_key(|(seq, _)| std::cmp::Reverse(*seq));
            ready.truncate(self.cfg.batch_size);

            let items: Vec<BatchItem> = ready
                .iter()
                .map(|(_, task)| {
                    let mut ts = task.state.lock();
                    ts.processing = true;
                    BatchItem {
                        key: task.key.clone(),
                        payload: ts.payload.clone(),
                    }
                })
                .collect();
            st.in_flight += 1;
            drop(st);

            debug!(stage = self.label, size = items.len(), "batch dispatched");
            let stage = self.clone();
            let tasks: Vec<TaskRef> = ready.into_iter().map(|(_, task)| task).collect();
            tokio::spawn(async move {
                stage.run_batch(tasks, items).await;
            });
        }
    }

    async fn run_batch(self: Arc<Self>, tasks: Vec<TaskRef>, items: Vec<BatchItem>) {
        let Some(links) = self.links.get() else {
            return;
        };

        match self.resolver.resolve(&items).await {
            Ok(results) if results.len() == items.len() => {
                for (task, outcome) in tasks.iter().zip(results) {
                    match outcome {
                        Some(value) => self.finish_hit(links, task, value),
                        None => self.promote_or_finish_absent(links, task),
                    }
                }
            }
            Ok(results) => {
                warn!(
                    stage = self.label,
                    expected = items.len(),
                    got = results.len(),
                    "resolver returned a misaligned batch response"
                );
                let err = CacheError::tier(self.resolver.tier(), "misaligned batch response");
                self.fail_batch(links, &tasks, err);
            }
            Err(err) => {
                warn!(stage = self.label, error = %err, "batch failed");
                self.fail_batch(links, &tasks, err);
            }
        }

        {
            let mut st = self.state.lock();
            st.in_flight -= 1;
        }
        // Freed capacity: keep draining whatever is ready.
        self.pump();
    }

    fn finish_hit(self: &Arc<Self>, links: &StageLinks, task: &TaskRef, value: Value) {
        {
            let mut st = self.state.lock();
            st.pending.remove(&task.key);
        }
        if let Some(hook) = &self.on_hit {
            hook(&task.key, &value);
        }
        if !links.index.try_complete(task, Ok(Some(value))) {
            self.rerun_from_head(links, task);
        }
    }

    fn promote_or_finish_absent(self: &Arc<Self>, links: &StageLinks, task: &TaskRef) {
        {
            let mut st = self.state.lock();
            st.pending.remove(&task.key);
        }
        match &links.next {
            Some(next) => {
                {
                    let mut ts = task.state.lock();
                    ts.processing = false;
                }
                debug!(stage = self.label, key = %task.key, "promoted");
                next.enqueue(task.clone());
            }
            None => {
                if !links.index.try_complete(task, Ok(None)) {
                    self.rerun_from_head(links, task);
                }
            }
        }
    }

    /// A newer write replaced the payload mid-batch: run the task from the
    /// chain head so the fresh value traverses the full path.
    fn rerun_from_head(self: &Arc<Self>, links: &StageLinks, task: &TaskRef) {
        debug!(stage = self.label, key = %task.key, "write superseded mid-batch, re-running");
        match &links.head {
            None => self.enqueue(task.clone()),
            Some(head) => match head.upgrade() {
                Some(head) => head.enqueue(task.clone()),
                None => links
                    .index
                    .force_complete(task, Err(CacheError::Internal("chain head dropped"))),
            },
        }
    }

    fn fail_batch(&self, links: &StageLinks, tasks: &[TaskRef], err: CacheError) {
        {
            let mut st = self.state.lock();
            for task in tasks {
                st.pending.remove(&task.key);
            }
        }
        for task in tasks {
            links.index.force_complete(task, Err(err.clone()));
        }
    }

    /// Depth snapshot for monitoring.
    pub fn depth(&self) -> StageDepth {
        let st = self.state.lock();
        StageDepth {
            stage: self.label,
            pending: st.pending.len(),
            ready: Self::ready(&st).len(),
            in_flight_batches: st.in_flight,
        }
    }
}

impl std::fmt::Debug for ResolutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("ResolutionStage")
            .field("label", &self.label)
            .field("pending", &st.pending.len())
            .field("in_flight", &st.in_flight)
            .finish()
    }
}
