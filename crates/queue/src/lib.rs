//! Per-tenant fair task queues and the rate-limited delivery queue.
//!
//! Two queue families share one design:
//!
//! - [`FairQueue`] — named task queues with per-owner sub-queues and an
//!   active-owners index; pop picks the owner with the fewest tasks in
//!   flight, so no tenant starves another regardless of backlog depth.
//! - [`DeliveryQueue`] — per-destination outbound queues split into bulk and
//!   high tiers, with a per-second throughput ceiling per destination.
//!
//! Every store operation (push, pop, done, pause, resume) is atomic at the
//! store: one Lua script against Redis, or one critical section in the
//! in-memory store. No in-process lock guards a cross-process invariant —
//! multiple independent processes pop from the same queues concurrently, and
//! correctness must not depend on which process runs the operation.

pub mod delivery;
pub mod envelope;
pub mod fair;
pub mod memory;
pub mod store;

#[cfg(feature = "redis")]
pub mod redis;

pub use delivery::{DeliveryQueue, DeliveryStore, Destination, InMemoryDeliveryStore, Tier};
pub use envelope::{Priority, Task};
pub use fair::FairQueue;
pub use memory::InMemoryQueueStore;
pub use store::{Popped, QueueError, QueueStore};

#[cfg(feature = "redis")]
pub use redis::{RedisDeliveryStore, RedisQueueStore};
