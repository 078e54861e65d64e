//! Task cells and the per-chain in-flight index.
//!
//! A task is one outstanding request for a key. It is a shared cell: the
//! stage that currently owns it holds it in its pending table, and the
//! chain's in-flight index holds it so that later callers for the same key
//! can attach as additional waiters instead of spawning a second resolution.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::CacheError;

/// Request keys are opaque strings (paths, URLs, composite IDs).
pub type Key = String;

/// Values are opaque byte payloads, cheaply clonable for fan-out to
/// coalesced waiters.
pub type Value = Bytes;

/// What every waiter receives: `Ok(Some(v))` for a hit or a write ack,
/// `Ok(None)` for a full miss, `Err` for eviction or tier failure.
pub type TaskResult = Result<Option<Value>, CacheError>;

pub(crate) type Waiter = oneshot::Sender<TaskResult>;

/// What a task carries through the chain.
#[derive(Debug, Clone)]
pub enum TaskPayload {
    /// A lookup. Carries nothing.
    Read,
    /// A write. Carries the value to persist.
    Write(Value),
}

/// Mutable task state, guarded by the cell's own mutex.
#[derive(Debug)]
pub(crate) struct TaskState {
    pub payload: TaskPayload,
    pub waiters: Vec<Waiter>,
    /// Set while the task is part of an in-flight batch. A processing task
    /// is never selected into a second batch.
    pub processing: bool,
    /// Write chains only: the payload was replaced after the task had
    /// already passed the chain head. On successful completion the task
    /// re-enters the head so the newest value traverses the full path.
    pub dirty: bool,
    /// Index of the stage that currently owns the task.
    pub stage_idx: usize,
}

/// One outstanding request for a key, shared between the owning stage and
/// the chain's in-flight index.
#[derive(Debug)]
pub(crate) struct Task {
    pub key: Key,
    pub state: Mutex<TaskState>,
}

pub(crate) type TaskRef = Arc<Task>;

impl Task {
    pub fn new(key: Key, payload: TaskPayload) -> TaskRef {
        Arc::new(Self {
            key,
            state: Mutex::new(TaskState {
                payload,
                waiters: Vec::new(),
                processing: false,
                dirty: false,
                stage_idx: 0,
            }),
        })
    }
}

/// The chain-wide registry of live tasks, keyed by request key.
///
/// Invariant: a key maps to at most one live task per chain. The index lock
/// guards both membership and waiter attachment, so a task cannot complete
/// between a lookup and the attach. Lock order is index → task cell; stage
/// locks are never taken while the index lock is held.
#[derive(Debug, Default)]
pub(crate) struct InflightIndex {
    pub(crate) entries: Mutex<HashMap<Key, TaskRef>>,
}

impl InflightIndex {
    /// Complete a task, notifying every waiter with a clone of `result`.
    ///
    /// Returns `false` without completing when a newer write superseded the
    /// task mid-batch (`dirty`); the caller re-enqueues it at the chain
    /// head. The dirty check happens under the index lock so it cannot race
    /// a concurrent waiter attach.
    pub fn try_complete(&self, task: &TaskRef, result: TaskResult) -> bool {
        let mut entries = self.entries.lock();
        let waiters = {
            let mut state = task.state.lock();
            if state.dirty {
                state.dirty = false;
                state.processing = false;
                return false;
            }
            std::mem::take(&mut state.waiters)
        };
        if entries
            .get(&task.key)
            .is_some_and(|live| Arc::ptr_eq(live, task))
        {
            entries.remove(&task.key);
        }
        drop(entries);

        for waiter in waiters {
            // A dropped caller is not an error: the result simply has
            // nowhere to go.
            let _ = waiter.send(result.clone());
        }
        true
    }

    /// Complete a task unconditionally — used for backpressure sheds and
    /// batch-level failures, which override any pending rewrite.
    pub fn force_complete(&self, task: &TaskRef, result: TaskResult) {
        let mut entries = self.entries.lock();
        let waiters = {
            let mut state = task.state.lock();
            state.dirty = false;
            std::mem::take(&mut state.waiters)
        };
        if entries
            .get(&task.key)
            .is_some_and(|live| Arc::ptr_eq(live, task))
        {
            entries.remove(&task.key);
        }
        drop(entries);

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Number of live tasks in the chain.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_notifies_all_waiters() {
        let index = InflightIndex::default();
        let task = Task::new("k".to_string(), TaskPayload::Read);
        index.entries.lock().insert("k".to_string(), task.clone());

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        {
            let mut state = task.state.lock();
            state.waiters.push(tx1);
            state.waiters.push(tx2);
        }

        assert!(index.try_complete(&task, Ok(Some(Bytes::from("v")))));
        assert_eq!(index.len(), 0);

        let r1 = rx1.await.unwrap().unwrap();
        let r2 = rx2.await.unwrap().unwrap();
        assert_eq!(r1, Some(Bytes::from("v")));
        assert_eq!(r1, r2);
    }

    #[tokio::test]
    async fn test_dirty_task_defers_completion() {
        let index = InflightIndex::default();
        let task = Task::new("k".to_string(), TaskPayload::Write(Bytes::from("v2")));
        index.entries.lock().insert("k".to_string(), task.clone());
        {
            let mut state = task.state.lock();
            state.processing = true;
            state.dirty = true;
        }

        // The stale batch result must not complete the task.
        assert!(!index.try_complete(&task, Ok(Some(Bytes::from("v1")))));
        assert_eq!(index.len(), 1);

        let state = task.state.lock();
        assert!(!state.dirty);
        assert!(!state.processing);
    }

    #[tokio::test]
    async fn test_force_complete_overrides_dirty() {
        let index = InflightIndex::default();
        let task = Task::new("k".to_string(), TaskPayload::Write(Bytes::from("v")));
        index.entries.lock().insert("k".to_string(), task.clone());

        let (tx, rx) = oneshot::channel();
        {
            let mut state = task.state.lock();
            state.waiters.push(tx);
            state.dirty = true;
        }

        index.force_complete(&task, Err(CacheError::Evicted { stage: "durable" }));
        assert_eq!(index.len(), 0);
        assert!(matches!(
            rx.await.unwrap(),
            Err(CacheError::Evicted { stage: "durable" })
        ));
    }
}
