//! The scored task envelope — the wire format for one unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowline_core::OwnerId;

/// Priority bias applied to a task's score, in seconds.
///
/// Scores are enqueue-time based, so a bias this large cleanly partitions the
/// sub-queue into tiers: every high-priority task sorts before every default
/// one pushed within ~115 days of it, which is far beyond any realistic queue
/// residency.
pub const PRIORITY_BIAS_SECS: i64 = 10_000_000;

/// Scheduling priority of a task within its owner's sub-queue.
///
/// Priority only reorders work *within* one owner; it never lets an owner
/// jump the fairness line across tenants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Sorts before everything else the owner has queued.
    High,
    #[default]
    Default,
    /// Sorts after everything else the owner has queued.
    Low,
}

impl Priority {
    /// Score bias in microseconds (scores are epoch microseconds).
    pub fn bias_micros(self) -> i64 {
        match self {
            Priority::High => -PRIORITY_BIAS_SECS * 1_000_000,
            Priority::Default => 0,
            Priority::Low => PRIORITY_BIAS_SECS * 1_000_000,
        }
    }
}

/// Sub-queue score for a task enqueued at `at` with the given priority.
///
/// Microsecond resolution keeps FIFO order within a priority tier.
pub fn score_micros(at: DateTime<Utc>, priority: Priority) -> i64 {
    at.timestamp_micros() + priority.bias_micros()
}

/// One unit of work: a type tag for handler routing, the owner whose
/// fairness bucket it counts against, and an opaque payload.
///
/// The core never looks inside `payload`; the consumer's registry maps
/// `task_type` to a deserializer + handler. Payload ownership transfers to
/// the popping worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "type")]
    pub task_type: String,
    pub owner_id: OwnerId,
    pub payload: serde_json::Value,
    pub queued_on: DateTime<Utc>,
    #[serde(default)]
    pub error_count: u32,
}

impl Task {
    /// Create a fresh task enqueued now.
    pub fn new(
        task_type: impl Into<String>,
        owner_id: OwnerId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            owner_id,
            payload,
            queued_on: Utc::now(),
            error_count: 0,
        }
    }

    /// Copy of this task with `error_count` bumped and `queued_on` refreshed,
    /// for handler-driven re-enqueue after a failure.
    pub fn retried(&self) -> Self {
        Self {
            error_count: self.error_count + 1,
            queued_on: Utc::now(),
            ..self.clone()
        }
    }
}
