//! Dispatch pool: one foreman thread assigning popped tasks to a fixed set
//! of worker threads.
//!
//! Handoff uses two bounded channels: workers advertise their index on a
//! shared availability channel, and each worker receives work on its own
//! single-slot job channel — at most one task in flight per worker. The
//! foreman drains bursts without sleeping and backs off `poll_interval` per
//! idle pop, so a mixed busy/idle pool polls the store only at the idle
//! rate.
//!
//! The store, not this process, owns every fairness invariant: other
//! processes run their own foremen against the same queues.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use flowline_queue::{FairQueue, QueueStore, Task};

use crate::registry::{TaskContext, TaskRegistry};

/// Dispatch pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name for logging and thread names.
    pub name: String,
    /// Number of worker threads.
    pub workers: usize,
    /// Sleep after an idle pop, and the foreman's quit-poll tick.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "dispatch".to_string(),
            workers: 4,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl PoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Defaults overridden by `DISPATCH_WORKERS` / `DISPATCH_POLL_MS` when
    /// set and parseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(workers) = env_parse::<usize>("DISPATCH_WORKERS") {
            config.workers = workers.max(1);
        }
        if let Some(ms) = env_parse::<u64>("DISPATCH_POLL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub panicked: u64,
    pub timed_out: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct PoolHandle {
    quit: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl PoolHandle {
    /// Request graceful shutdown: stop assigning, let in-flight tasks
    /// finish, join every worker, then return.
    pub fn shutdown(mut self) {
        let _ = self.quit.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Snapshot of current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Coordinating loop popping tasks from one fair queue and assigning them
/// to idle workers.
pub struct Foreman<S> {
    queue: FairQueue<S>,
    registry: Arc<TaskRegistry>,
}

impl<S> Foreman<S>
where
    S: QueueStore + Clone + Send + Sync + 'static,
{
    pub fn new(queue: FairQueue<S>, registry: Arc<TaskRegistry>) -> Self {
        Self { queue, registry }
    }

    /// Launch the workers and the assignment loop in background threads.
    pub fn start(self, config: PoolConfig) -> PoolHandle {
        let (quit_tx, quit_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(PoolStats::default()));
        let stats_clone = stats.clone();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(format!("{name}-foreman"))
            .spawn(move || {
                foreman_loop(self.queue, self.registry, config, quit_rx, stats_clone);
            })
            .expect("failed to spawn foreman thread");

        PoolHandle {
            quit: quit_tx,
            join: Some(join),
            stats,
        }
    }
}

fn foreman_loop<S>(
    queue: FairQueue<S>,
    registry: Arc<TaskRegistry>,
    config: PoolConfig,
    quit_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<PoolStats>>,
) where
    S: QueueStore + Clone + Send + Sync + 'static,
{
    let workers = config.workers.max(1);
    let (avail_tx, avail_rx) = sync_channel::<usize>(workers);

    let mut job_txs: Vec<SyncSender<Task>> = Vec::with_capacity(workers);
    let mut joins = Vec::with_capacity(workers);

    for idx in 0..workers {
        let (job_tx, job_rx) = sync_channel::<Task>(1);
        job_txs.push(job_tx);

        let worker_queue = queue.clone();
        let worker_registry = registry.clone();
        let worker_avail = avail_tx.clone();
        let worker_stats = stats.clone();
        let pool_name = config.name.clone();

        let join = thread::Builder::new()
            .name(format!("{}-worker-{idx}", config.name))
            .spawn(move || {
                worker_loop(
                    idx,
                    pool_name,
                    worker_queue,
                    worker_registry,
                    worker_avail,
                    job_rx,
                    worker_stats,
                );
            })
            .expect("failed to spawn worker thread");
        joins.push(join);
    }

    info!(pool = %config.name, workers, "dispatch pool started");
    let start_time = Instant::now();

    loop {
        if quit_rx.try_recv().is_ok() {
            break;
        }

        {
            let mut s = stats.lock().unwrap();
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        // Block for an idle worker; the timeout doubles as the quit poll.
        let idx = match avail_rx.recv_timeout(config.poll_interval) {
            Ok(idx) => idx,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match queue.pop() {
            Ok(Some(task)) => {
                debug!(
                    pool = %config.name,
                    worker = idx,
                    task_type = %task.task_type,
                    owner = %task.owner_id,
                    "assigning task"
                );
                if let Err(send_err) = job_txs[idx].send(task) {
                    // The worker is gone; release the slot its done would
                    // have released.
                    let task = send_err.0;
                    error!(
                        pool = %config.name,
                        worker = idx,
                        task_type = %task.task_type,
                        "worker unavailable, releasing popped task"
                    );
                    if let Err(e) = queue.done(task.owner_id) {
                        error!(pool = %config.name, error = %e, "failed to release task slot");
                    }
                }
                // No sleep: drain bursts at full speed.
            }
            Ok(None) => {
                // Nothing queued. Hand the worker back and back off so an
                // idle pool polls the store at a bounded rate.
                let _ = avail_tx.send(idx);
                thread::sleep(config.poll_interval);
            }
            Err(e) => {
                // Transient store failure: retry after backoff, never treat
                // as empty and never crash the pool.
                error!(pool = %config.name, error = %e, "pop failed, backing off");
                let _ = avail_tx.send(idx);
                thread::sleep(config.poll_interval);
            }
        }
    }

    // Closing the job channels is the stop signal workers observe once
    // their current task is finished.
    drop(job_txs);
    for join in joins {
        let _ = join.join();
    }

    info!(pool = %config.name, "dispatch pool stopped");
}

fn worker_loop<S>(
    idx: usize,
    pool: String,
    queue: FairQueue<S>,
    registry: Arc<TaskRegistry>,
    avail_tx: SyncSender<usize>,
    job_rx: Receiver<Task>,
    stats: Arc<Mutex<PoolStats>>,
) where
    S: QueueStore,
{
    loop {
        // Advertise, then wait for an assignment. The bounded channel pair
        // enforces at most one task in flight for this worker.
        if avail_tx.send(idx).is_err() {
            break;
        }
        match job_rx.recv() {
            Ok(task) => execute(&pool, idx, &queue, &registry, task, &stats),
            // Channel closed: the "no task" sentinel that ends the loop.
            Err(_) => break,
        }
    }
    debug!(pool = %pool, worker = idx, "worker stopped");
}

fn execute<S>(
    pool: &str,
    idx: usize,
    queue: &FairQueue<S>,
    registry: &TaskRegistry,
    task: Task,
    stats: &Arc<Mutex<PoolStats>>,
) where
    S: QueueStore,
{
    let owner = task.owner_id;
    let task_type = task.task_type.clone();
    let timeout = registry.timeout_for(&task_type);

    {
        let mut s = stats.lock().unwrap();
        s.current_running += 1;
    }

    let started = Instant::now();
    let ctx = TaskContext::new(timeout);
    let result = catch_unwind(AssertUnwindSafe(|| registry.handle(&task, &ctx)));

    // The owner's fairness slot is released on every exit path — success,
    // handler error, or recovered panic.
    if let Err(e) = queue.done(owner) {
        error!(pool = %pool, owner = %owner, error = %e, "failed to mark task done");
    }

    let elapsed = started.elapsed();
    let duration_ms = elapsed.as_millis() as u64;

    let mut s = stats.lock().unwrap();
    s.current_running = s.current_running.saturating_sub(1);
    s.processed += 1;

    match result {
        Ok(Ok(())) => {
            s.succeeded += 1;
            debug!(
                pool = %pool,
                worker = idx,
                task_type = %task_type,
                owner = %owner,
                duration_ms,
                "task completed"
            );
        }
        Ok(Err(e)) => {
            s.failed += 1;
            error!(
                pool = %pool,
                worker = idx,
                task_type = %task_type,
                owner = %owner,
                duration_ms,
                error = %e,
                "task failed"
            );
        }
        Err(panic) => {
            s.panicked += 1;
            error!(
                pool = %pool,
                worker = idx,
                task_type = %task_type,
                owner = %owner,
                duration_ms,
                panic = %panic_message(&panic),
                "task panicked"
            );
        }
    }

    if elapsed > timeout {
        s.timed_out += 1;
        warn!(
            pool = %pool,
            worker = idx,
            task_type = %task_type,
            owner = %owner,
            duration_ms,
            timeout_ms = timeout.as_millis() as u64,
            "task ran past its timeout"
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
