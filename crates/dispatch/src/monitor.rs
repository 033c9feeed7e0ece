//! Queue-depth monitoring.
//!
//! Polls the read-only query surface — `size()` per named queue, and the
//! delivery queue's per-destination occupancy — on a fixed interval and
//! emits the readings as structured fields on log records (gauge
//! semantics; a log collector turns them into series).

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use flowline_queue::{DeliveryQueue, DeliveryStore, Destination, FairQueue, QueueStore, Tier};

/// Handle to control a running monitor loop.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawns background loops reporting queue gauges.
#[derive(Debug)]
pub struct QueueMonitor;

impl QueueMonitor {
    /// Report `size()` for each fair queue every `interval`.
    pub fn spawn_queues<S>(queues: Vec<FairQueue<S>>, interval: Duration) -> MonitorHandle
    where
        S: QueueStore + Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("queue-monitor".to_string())
            .spawn(move || {
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    for queue in &queues {
                        match queue.size() {
                            Ok(size) => info!(queue = %queue.name(), size, "queue depth"),
                            Err(e) => {
                                warn!(queue = %queue.name(), error = %e, "queue depth read failed")
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn queue monitor thread");

        MonitorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }

    /// Report tier depths, window occupancy, and active state for each
    /// watched destination every `interval`.
    pub fn spawn_delivery<S>(
        delivery: DeliveryQueue<S>,
        destinations: Vec<Destination>,
        interval: Duration,
    ) -> MonitorHandle
    where
        S: DeliveryStore + Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("delivery-monitor".to_string())
            .spawn(move || {
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let now = Utc::now();
                    for dest in &destinations {
                        let reading = (|| -> Result<_, flowline_queue::QueueError> {
                            Ok((
                                dest.key(),
                                delivery.queued(dest, Tier::Bulk)?,
                                delivery.queued(dest, Tier::High)?,
                                delivery.window_count(dest, now)?,
                                delivery.is_active(dest)?,
                            ))
                        })();
                        match reading {
                            Ok((key, bulk, high, window, active)) => info!(
                                destination = %key,
                                queued_bulk = bulk,
                                queued_high = high,
                                window_count = window,
                                active,
                                "delivery destination"
                            ),
                            Err(e) => warn!(
                                destination = %dest.key(),
                                error = %e,
                                "delivery gauge read failed"
                            ),
                        }
                    }
                }
            })
            .expect("failed to spawn delivery monitor thread");

        MonitorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}
