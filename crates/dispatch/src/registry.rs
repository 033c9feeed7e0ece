//! Task type registry: string tag → handler + per-type policy.
//!
//! Built at startup and passed by reference — there is no global
//! registration map. The core never deserializes a payload itself; the
//! handler registered for a type owns that.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use flowline_queue::Task;

/// Default execution budget for types registered without one being
/// meaningful (and for unknown types when reporting overruns).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default retry cap when a type doesn't declare its own.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Ambient context handed to a task handler.
///
/// Cancellation is cooperative: the handler is expected to check
/// [`deadline_exceeded`](TaskContext::deadline_exceeded) at its own safe
/// points — nothing forcibly terminates the executing thread.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    started: Instant,
    timeout: Duration,
}

impl TaskContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.started.elapsed() > self.timeout
    }
}

/// Handler for one task type: deserialize the payload it knows, do the
/// work, report success or error. Retries are the handler's own business
/// (typically a re-push of [`Task::retried`] while [`TaskRegistry::retry`]
/// still allows it).
pub type TaskHandler = Box<dyn Fn(&Task, &TaskContext) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    handler: TaskHandler,
    timeout: Duration,
    max_attempts: u32,
}

/// Registry mapping task type tags to handlers and per-type policy
/// (execution timeout, retry cap).
#[derive(Default)]
pub struct TaskRegistry {
    entries: HashMap<String, Registration>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type. Lookup is by exact tag.
    pub fn register<F>(
        &mut self,
        task_type: impl Into<String>,
        timeout: Duration,
        max_attempts: u32,
        handler: F,
    ) where
        F: Fn(&Task, &TaskContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.entries.insert(
            task_type.into(),
            Registration {
                handler: Box::new(handler),
                timeout,
                max_attempts,
            },
        );
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.entries.contains_key(task_type)
    }

    /// Declared execution budget for a type.
    pub fn timeout_for(&self, task_type: &str) -> Duration {
        self.entries
            .get(task_type)
            .map(|r| r.timeout)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Declared retry cap for a type (total attempts, first one included).
    pub fn max_attempts(&self, task_type: &str) -> u32 {
        self.entries
            .get(task_type)
            .map(|r| r.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    /// The retried copy of a failed task, or `None` once the type's attempt
    /// cap is spent. Attempt `n` is `error_count == n - 1`.
    pub fn retry(&self, task: &Task) -> Option<Task> {
        if task.error_count + 1 < self.max_attempts(&task.task_type) {
            Some(task.retried())
        } else {
            None
        }
    }

    /// Run the registered handler for the task's type.
    pub fn handle(&self, task: &Task, ctx: &TaskContext) -> anyhow::Result<()> {
        let registration = self
            .entries
            .get(&task.task_type)
            .ok_or_else(|| anyhow::anyhow!("no handler registered for task type: {}", task.task_type))?;
        (registration.handler)(task, ctx)
    }
}
