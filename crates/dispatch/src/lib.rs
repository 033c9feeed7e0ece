//! Task dispatch: handler registry, worker pools, cron promotion, and
//! queue monitoring.
//!
//! A [`Foreman`] owns a fixed-size pool of worker threads and feeds them
//! from one [`FairQueue`](flowline_queue::FairQueue). Multiple pools
//! typically coexist in one process (bulk/batch work vs. latency-sensitive
//! per-tenant work), each independently sized, all sharing the same store.

pub mod cron;
pub mod monitor;
pub mod pool;
pub mod registry;

#[cfg(test)]
mod integration_tests;

pub use cron::{CronHandle, CronRunner, CronTask};
pub use monitor::{MonitorHandle, QueueMonitor};
pub use pool::{Foreman, PoolConfig, PoolHandle, PoolStats};
pub use registry::{TaskContext, TaskRegistry};
