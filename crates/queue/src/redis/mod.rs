//! Redis-backed stores (production).
//!
//! Every mutating operation is one Lua script, so the multi-key sequences
//! (choose owner → pop task → bump index; enqueue → check window → flip
//! active flag) are indivisible under concurrent callers in other processes.
//! Read-only lookups use plain commands.
//!
//! Connections are checked out per operation from the shared
//! [`redis::Client`], the same shape as any other store adapter here.

mod delivery;
mod fair;

pub use delivery::RedisDeliveryStore;
pub use fair::RedisQueueStore;

use crate::store::QueueError;

fn store_err(e: redis::RedisError) -> QueueError {
    QueueError::Store(e.to_string())
}

fn conn_err(e: redis::RedisError) -> QueueError {
    QueueError::Connection(e.to_string())
}
