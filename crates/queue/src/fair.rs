//! Caller-facing API over one named fair queue.

use chrono::Utc;
use tracing::debug;

use flowline_core::OwnerId;

use crate::envelope::{Priority, Task, score_micros};
use crate::store::{Popped, QueueError, QueueStore};

/// One named fair queue over a shared store.
///
/// Cheap to clone when the store is (e.g. `Arc`-wrapped); producers, the
/// dispatch pool, and monitors each hold their own handle.
#[derive(Debug, Clone)]
pub struct FairQueue<S> {
    store: S,
    name: String,
}

impl<S> FairQueue<S>
where
    S: QueueStore,
{
    pub fn new(store: S, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a fresh task for `owner`.
    pub fn push(
        &self,
        task_type: impl Into<String>,
        owner: OwnerId,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<(), QueueError> {
        self.push_task(&Task::new(task_type, owner, payload), priority)
    }

    /// Queue an existing envelope (handler-driven retries re-enter here with
    /// an incremented `error_count`).
    pub fn push_task(&self, task: &Task, priority: Priority) -> Result<(), QueueError> {
        let score = score_micros(Utc::now(), priority);
        self.store.push(&self.name, task, score)?;

        debug!(
            queue = %self.name,
            task_type = %task.task_type,
            owner = %task.owner_id,
            ?priority,
            "queued task"
        );
        Ok(())
    }

    /// Check out the next task, favoring the owner with the fewest in
    /// flight.
    ///
    /// Drives the store's stale-entry retry signal internally: each retry
    /// removes one stale owner from the index, so the loop strictly shrinks
    /// the candidate set and terminates.
    pub fn pop(&self) -> Result<Option<Task>, QueueError> {
        loop {
            match self.store.pop(&self.name)? {
                Popped::Task(task) => return Ok(Some(task)),
                Popped::Empty => return Ok(None),
                Popped::Retry => {
                    debug!(queue = %self.name, "dropped stale owner index entry");
                }
            }
        }
    }

    /// Release one fairness slot after a popped task finishes (success,
    /// failure, or panic — every exit path).
    pub fn done(&self, owner: OwnerId) -> Result<(), QueueError> {
        self.store.done(&self.name, owner)
    }

    /// Quarantine an owner: its queued work stays put but is never popped.
    pub fn pause(&self, owner: OwnerId) -> Result<(), QueueError> {
        debug!(queue = %self.name, %owner, "pausing owner");
        self.store.pause(&self.name, owner)
    }

    /// Lift a quarantine; queued work becomes poppable in original order.
    pub fn resume(&self, owner: OwnerId) -> Result<(), QueueError> {
        debug!(queue = %self.name, %owner, "resuming owner");
        self.store.resume(&self.name, owner)
    }

    /// Queued-but-not-popped task count, for monitoring.
    pub fn size(&self) -> Result<usize, QueueError> {
        self.store.size(&self.name)
    }

    /// Current in-flight count for one owner.
    pub fn in_flight(&self, owner: OwnerId) -> Result<i64, QueueError> {
        self.store.in_flight(&self.name, owner)
    }
}
