//! Store abstraction for fair queues.
//!
//! One trait method = one atomic store operation. The Redis implementation
//! backs each method with a single Lua script; the in-memory implementation
//! backs each with one critical section. Callers may assume no interleaving
//! within a method, even with concurrent poppers in other processes.

use std::sync::Arc;

use thiserror::Error;

use flowline_core::OwnerId;

use crate::envelope::Task;

/// Count bias added to a paused owner's active-index entry.
///
/// Large enough that a paused owner always sorts after every live owner
/// (real in-flight counts are bounded by total worker slots, which is tiny
/// next to a million), while keeping the underlying count recoverable on
/// resume.
pub const PAUSED_SENTINEL: i64 = 1_000_000;

/// Outcome of one atomic pop attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Popped {
    /// A task was checked out; the owner's in-flight count was incremented.
    Task(Task),
    /// The chosen owner was indexed but had an empty sub-queue (e.g. a
    /// worker crashed before calling done). The stale entry was removed;
    /// the caller must try again.
    Retry,
    /// No owner has queued work.
    Empty,
}

/// Errors surfaced by queue stores.
///
/// Transient store failures surface to the caller; a pop failure means
/// "retry after backoff", never "queue empty".
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Atomic operations over named fair queues.
///
/// Implementations must keep two invariants regardless of concurrent
/// callers:
///
/// - pop's choose-owner → pop-task → bump-index sequence is indivisible;
/// - an owner's in-flight count never goes negative, even under duplicate
///   done calls from at-least-once retry paths.
pub trait QueueStore: Send + Sync {
    /// Append a task to its owner's sub-queue at `score_micros` and touch
    /// the active-owners index with a zero-delta update, so the owner is
    /// pop-visible even if it had no prior entry.
    fn push(&self, queue: &str, task: &Task, score_micros: i64) -> Result<(), QueueError>;

    /// Atomically pick the non-paused owner with the smallest in-flight
    /// count, pop its lowest-scored task, and increment its count.
    fn pop(&self, queue: &str) -> Result<Popped, QueueError>;

    /// Decrement the owner's in-flight count, floored so it never goes
    /// negative (and never drops below the pause sentinel while paused).
    fn done(&self, queue: &str, owner: OwnerId) -> Result<(), QueueError>;

    /// Deprioritize the owner so pop never selects it, without discarding
    /// queued work. Idempotent.
    fn pause(&self, queue: &str, owner: OwnerId) -> Result<(), QueueError>;

    /// Undo `pause`. Idempotent.
    fn resume(&self, queue: &str, owner: OwnerId) -> Result<(), QueueError>;

    /// Total queued-but-not-popped tasks across owners.
    fn size(&self, queue: &str) -> Result<usize, QueueError>;

    /// The owner's current in-flight count (pause sentinel excluded).
    fn in_flight(&self, queue: &str, owner: OwnerId) -> Result<i64, QueueError>;
}

impl<S> QueueStore for Arc<S>
where
    S: QueueStore + ?Sized,
{
    fn push(&self, queue: &str, task: &Task, score_micros: i64) -> Result<(), QueueError> {
        (**self).push(queue, task, score_micros)
    }

    fn pop(&self, queue: &str) -> Result<Popped, QueueError> {
        (**self).pop(queue)
    }

    fn done(&self, queue: &str, owner: OwnerId) -> Result<(), QueueError> {
        (**self).done(queue, owner)
    }

    fn pause(&self, queue: &str, owner: OwnerId) -> Result<(), QueueError> {
        (**self).pause(queue, owner)
    }

    fn resume(&self, queue: &str, owner: OwnerId) -> Result<(), QueueError> {
        (**self).resume(queue, owner)
    }

    fn size(&self, queue: &str) -> Result<usize, QueueError> {
        (**self).size(queue)
    }

    fn in_flight(&self, queue: &str, owner: OwnerId) -> Result<i64, QueueError> {
        (**self).in_flight(queue, owner)
    }
}
