//! In-memory queue store for tests/dev.
//!
//! Every trait method runs as one critical section under the store mutex,
//! mirroring the single-round-trip Lua scripts of the Redis store. Sub-queue
//! entries carry a monotonic sequence next to the score so equal scores stay
//! FIFO.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use flowline_core::OwnerId;

use crate::envelope::Task;
use crate::store::{PAUSED_SENTINEL, Popped, QueueError, QueueStore};

#[derive(Debug, Default)]
struct QueueState {
    /// Per-owner sub-queues, ordered by (score, insertion sequence).
    tasks: HashMap<OwnerId, BTreeMap<(i64, u64), Task>>,
    /// Active-owners index: owner → in-flight count, pause sentinel included.
    /// BTreeMap so equal counts break ties by owner id, deterministically.
    counts: BTreeMap<OwnerId, i64>,
    seq: u64,
}

/// In-memory implementation of [`QueueStore`].
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, QueueState>>, QueueError> {
        self.queues
            .lock()
            .map_err(|_| QueueError::Store("queue store lock poisoned".to_string()))
    }
}

impl QueueStore for InMemoryQueueStore {
    fn push(&self, queue: &str, task: &Task, score_micros: i64) -> Result<(), QueueError> {
        let mut queues = self.lock()?;
        let state = queues.entry(queue.to_string()).or_default();

        state.seq += 1;
        let seq = state.seq;
        state
            .tasks
            .entry(task.owner_id)
            .or_default()
            .insert((score_micros, seq), task.clone());

        // Zero-delta touch: makes the owner pop-visible without disturbing
        // an existing in-flight count or pause state.
        state.counts.entry(task.owner_id).or_insert(0);

        Ok(())
    }

    fn pop(&self, queue: &str) -> Result<Popped, QueueError> {
        let mut queues = self.lock()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Popped::Empty);
        };

        let chosen = state
            .counts
            .iter()
            .filter(|(_, count)| **count < PAUSED_SENTINEL)
            .min_by_key(|(owner, count)| (**count, **owner))
            .map(|(owner, _)| *owner);

        let Some(owner) = chosen else {
            return Ok(Popped::Empty);
        };

        match state.tasks.get_mut(&owner).and_then(|sub| sub.pop_first()) {
            Some((_, task)) => {
                *state.counts.entry(owner).or_insert(0) += 1;
                Ok(Popped::Task(task))
            }
            None => {
                // Indexed but nothing queued: a stale entry, typically left
                // by a worker that crashed before done. Drop it and let the
                // caller retry.
                state.tasks.remove(&owner);
                state.counts.remove(&owner);
                Ok(Popped::Retry)
            }
        }
    }

    fn done(&self, queue: &str, owner: OwnerId) -> Result<(), QueueError> {
        let mut queues = self.lock()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(());
        };

        let count = state.counts.entry(owner).or_insert(0);
        let floor = if *count >= PAUSED_SENTINEL {
            PAUSED_SENTINEL
        } else {
            0
        };
        *count = (*count - 1).max(floor);

        Ok(())
    }

    fn pause(&self, queue: &str, owner: OwnerId) -> Result<(), QueueError> {
        let mut queues = self.lock()?;
        let state = queues.entry(queue.to_string()).or_default();

        let count = state.counts.entry(owner).or_insert(0);
        if *count < PAUSED_SENTINEL {
            *count += PAUSED_SENTINEL;
        }

        Ok(())
    }

    fn resume(&self, queue: &str, owner: OwnerId) -> Result<(), QueueError> {
        let mut queues = self.lock()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(());
        };

        if let Some(count) = state.counts.get_mut(&owner) {
            if *count >= PAUSED_SENTINEL {
                *count -= PAUSED_SENTINEL;
            }
        }

        Ok(())
    }

    fn size(&self, queue: &str) -> Result<usize, QueueError> {
        let queues = self.lock()?;
        Ok(queues
            .get(queue)
            .map(|state| state.tasks.values().map(BTreeMap::len).sum())
            .unwrap_or(0))
    }

    fn in_flight(&self, queue: &str, owner: OwnerId) -> Result<i64, QueueError> {
        let queues = self.lock()?;
        let count = queues
            .get(queue)
            .and_then(|state| state.counts.get(&owner))
            .copied()
            .unwrap_or(0);

        Ok(if count >= PAUSED_SENTINEL {
            count - PAUSED_SENTINEL
        } else {
            count
        })
    }
}
