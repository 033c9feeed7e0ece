//! Cron promotion: lower-frequency loops that move due work (expirations,
//! timeouts, scheduled triggers) into the queues.
//!
//! The [`CronTask`] trait is the promotion interface; [`CronRunner`] drives
//! registered tasks at their declared intervals. Task failures are logged
//! and never stop the runner.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

/// One recurring promotion job. Implementations push work into fair queues
/// or the delivery queue when their sweep finds something due.
pub trait CronTask: Send + Sync {
    fn name(&self) -> &str;

    /// How often the task should run. Read once per completed run, so a
    /// task may vary its own cadence.
    fn interval(&self) -> Duration;

    fn run(&self) -> anyhow::Result<()>;
}

/// Handle to control a running cron loop.
#[derive(Debug)]
pub struct CronHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl CronHandle {
    /// Request graceful shutdown and wait for the loop to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Drives a set of [`CronTask`]s at their intervals on one background
/// thread.
#[derive(Debug)]
pub struct CronRunner;

impl CronRunner {
    pub fn spawn(tasks: Vec<Arc<dyn CronTask>>) -> CronHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("cron".to_string())
            .spawn(move || cron_loop(tasks, shutdown_rx))
            .expect("failed to spawn cron thread");

        CronHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

fn cron_loop(tasks: Vec<Arc<dyn CronTask>>, shutdown_rx: mpsc::Receiver<()>) {
    info!(tasks = tasks.len(), "cron runner started");

    let mut due: Vec<Instant> = tasks
        .iter()
        .map(|task| Instant::now() + task.interval())
        .collect();

    loop {
        let now = Instant::now();
        // Sleep until the earliest deadline; an idle runner still wakes
        // periodically so shutdown is never starved.
        let wake = due.iter().min().copied().unwrap_or(now + Duration::from_secs(60));
        let wait = wake.saturating_duration_since(now);

        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        for (task, next) in tasks.iter().zip(due.iter_mut()) {
            if *next > now {
                continue;
            }
            let started = Instant::now();
            match task.run() {
                Ok(()) => debug!(
                    task = task.name(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "cron task ran"
                ),
                Err(e) => error!(task = task.name(), error = %e, "cron task failed"),
            }
            *next = Instant::now() + task.interval();
        }
    }

    info!("cron runner stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct Counting {
        runs: Arc<AtomicU32>,
        fail: bool,
    }

    impl CronTask for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        fn run(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("sweep failed");
            }
            Ok(())
        }
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn tasks_run_repeatedly_at_their_interval() {
        let runs = Arc::new(AtomicU32::new(0));
        let handle = CronRunner::spawn(vec![Arc::new(Counting {
            runs: runs.clone(),
            fail: false,
        })]);

        assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 3));
        handle.shutdown();
    }

    #[test]
    fn failures_do_not_stop_the_runner() {
        let runs = Arc::new(AtomicU32::new(0));
        let handle = CronRunner::spawn(vec![Arc::new(Counting {
            runs: runs.clone(),
            fail: true,
        })]);

        assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 3));
        handle.shutdown();
    }

    #[test]
    fn empty_runner_shuts_down_cleanly() {
        let handle = CronRunner::spawn(Vec::new());
        thread::sleep(Duration::from_millis(10));
        handle.shutdown();
    }
}
