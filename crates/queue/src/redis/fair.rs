//! Redis implementation of [`QueueStore`].
//!
//! Layout per named queue:
//! - `{queue}:active` — sorted set, owner id → in-flight count (pause
//!   sentinel included in the score).
//! - `{queue}:{owner}` — sorted set, serialized task → score (epoch
//!   microseconds + priority bias).
//!
//! Ties on equal scores resolve member-lexicographically, which for the
//! active set means owner-id order — the same tie-break the in-memory store
//! uses.

use redis::{Client, Commands, Connection, Script};

use flowline_core::OwnerId;

use crate::envelope::Task;
use crate::store::{PAUSED_SENTINEL, Popped, QueueError, QueueStore};

use super::{conn_err, store_err};

/// Append to the owner sub-queue, then touch the active index with a
/// zero-delta increment so the owner is pop-visible without disturbing an
/// existing count or pause state.
const PUSH: &str = r#"
redis.call("ZADD", KEYS[2], ARGV[1], ARGV[2])
redis.call("ZINCRBY", KEYS[1], 0, ARGV[3])
return 1
"#;

/// Choose the lowest-count non-paused owner, pop its lowest-scored task,
/// bump its count. A stale index entry (owner listed, sub-queue empty) is
/// removed and signalled as "retry" so a crashed worker can never wedge its
/// owner's fairness slot.
const POP: &str = r#"
local owners = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", "(" .. ARGV[1], "LIMIT", 0, 1)
if #owners == 0 then
  return {"empty"}
end
local owner = owners[1]
local popped = redis.call("ZPOPMIN", ARGV[2] .. ":" .. owner)
if #popped == 0 then
  redis.call("ZREM", KEYS[1], owner)
  return {"retry"}
end
redis.call("ZINCRBY", KEYS[1], 1, owner)
return {"task", popped[1]}
"#;

/// Decrement the in-flight count, floored at zero — or at the pause
/// sentinel while paused, so duplicate dones never eat into pause state.
const DONE: &str = r#"
local sent = tonumber(ARGV[2])
local count = tonumber(redis.call("ZSCORE", KEYS[1], ARGV[1])) or 0
local floor = 0
if count >= sent then
  floor = sent
end
count = count - 1
if count < floor then
  count = floor
end
redis.call("ZADD", KEYS[1], count, ARGV[1])
return count
"#;

const PAUSE: &str = r#"
local sent = tonumber(ARGV[2])
local count = tonumber(redis.call("ZSCORE", KEYS[1], ARGV[1])) or 0
if count < sent then
  redis.call("ZADD", KEYS[1], count + sent, ARGV[1])
end
return 1
"#;

const RESUME: &str = r#"
local sent = tonumber(ARGV[2])
local count = tonumber(redis.call("ZSCORE", KEYS[1], ARGV[1]))
if count and count >= sent then
  redis.call("ZADD", KEYS[1], count - sent, ARGV[1])
end
return 1
"#;

const SIZE: &str = r#"
local owners = redis.call("ZRANGE", KEYS[1], 0, -1)
local total = 0
for _, owner in ipairs(owners) do
  total = total + redis.call("ZCARD", ARGV[1] .. ":" .. owner)
end
return total
"#;

/// Redis-backed fair queue store.
pub struct RedisQueueStore {
    client: Client,
    push_script: Script,
    pop_script: Script,
    done_script: Script,
    pause_script: Script,
    resume_script: Script,
    size_script: Script,
}

impl RedisQueueStore {
    /// Connect to Redis (e.g. `redis://localhost:6379`).
    pub fn new(url: impl AsRef<str>) -> Result<Self, QueueError> {
        let client = Client::open(url.as_ref()).map_err(conn_err)?;
        Ok(Self {
            client,
            push_script: Script::new(PUSH),
            pop_script: Script::new(POP),
            done_script: Script::new(DONE),
            pause_script: Script::new(PAUSE),
            resume_script: Script::new(RESUME),
            size_script: Script::new(SIZE),
        })
    }

    fn conn(&self) -> Result<Connection, QueueError> {
        self.client.get_connection().map_err(conn_err)
    }

    fn active_key(queue: &str) -> String {
        format!("{queue}:active")
    }

    fn sub_key(queue: &str, owner: OwnerId) -> String {
        format!("{queue}:{owner}")
    }
}

impl QueueStore for RedisQueueStore {
    fn push(&self, queue: &str, task: &Task, score_micros: i64) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let body = serde_json::to_string(task)?;

        self.push_script
            .key(Self::active_key(queue))
            .key(Self::sub_key(queue, task.owner_id))
            .arg(score_micros)
            .arg(body)
            .arg(task.owner_id.to_string())
            .invoke::<i64>(&mut conn)
            .map_err(store_err)?;
        Ok(())
    }

    fn pop(&self, queue: &str) -> Result<Popped, QueueError> {
        let mut conn = self.conn()?;

        let reply: Vec<String> = self
            .pop_script
            .key(Self::active_key(queue))
            .arg(PAUSED_SENTINEL)
            .arg(queue)
            .invoke(&mut conn)
            .map_err(store_err)?;

        match reply.first().map(String::as_str) {
            Some("task") => {
                let body = reply
                    .get(1)
                    .ok_or_else(|| QueueError::Store("pop reply missing task body".to_string()))?;
                Ok(Popped::Task(serde_json::from_str(body)?))
            }
            Some("retry") => Ok(Popped::Retry),
            Some("empty") => Ok(Popped::Empty),
            other => Err(QueueError::Store(format!(
                "unexpected pop reply: {other:?}"
            ))),
        }
    }

    fn done(&self, queue: &str, owner: OwnerId) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        self.done_script
            .key(Self::active_key(queue))
            .arg(owner.to_string())
            .arg(PAUSED_SENTINEL)
            .invoke::<i64>(&mut conn)
            .map_err(store_err)?;
        Ok(())
    }

    fn pause(&self, queue: &str, owner: OwnerId) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        self.pause_script
            .key(Self::active_key(queue))
            .arg(owner.to_string())
            .arg(PAUSED_SENTINEL)
            .invoke::<i64>(&mut conn)
            .map_err(store_err)?;
        Ok(())
    }

    fn resume(&self, queue: &str, owner: OwnerId) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        self.resume_script
            .key(Self::active_key(queue))
            .arg(owner.to_string())
            .arg(PAUSED_SENTINEL)
            .invoke::<i64>(&mut conn)
            .map_err(store_err)?;
        Ok(())
    }

    fn size(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn()?;
        let total: i64 = self
            .size_script
            .key(Self::active_key(queue))
            .arg(queue)
            .invoke(&mut conn)
            .map_err(store_err)?;
        Ok(total.max(0) as usize)
    }

    fn in_flight(&self, queue: &str, owner: OwnerId) -> Result<i64, QueueError> {
        let mut conn = self.conn()?;
        let score: Option<f64> = conn
            .zscore(Self::active_key(queue), owner.to_string())
            .map_err(store_err)?;

        let count = score.unwrap_or(0.0) as i64;
        Ok(if count >= PAUSED_SENTINEL {
            count - PAUSED_SENTINEL
        } else {
            count
        })
    }
}

// Exercised against a live server: REDIS_URL=redis://localhost:6379 cargo
// test --features redis. Without the variable the tests are no-ops.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Priority;
    use crate::fair::FairQueue;

    fn live_store() -> Option<RedisQueueStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        Some(RedisQueueStore::new(url).expect("redis connection"))
    }

    #[test]
    fn roundtrip_push_pop_done_against_live_redis() {
        let Some(store) = live_store() else {
            return;
        };
        // Unique queue name per run so reruns never see stale keys.
        let queue = FairQueue::new(store, format!("test:{}", uuid::Uuid::now_v7()));
        let owner = OwnerId::new();

        queue
            .push("t-high", owner, serde_json::json!({"n": 2}), Priority::High)
            .unwrap();
        queue
            .push("t-low", owner, serde_json::json!({"n": 1}), Priority::Low)
            .unwrap();

        assert_eq!(queue.size().unwrap(), 2);
        assert_eq!(queue.pop().unwrap().unwrap().task_type, "t-high");
        assert_eq!(queue.in_flight(owner).unwrap(), 1);
        queue.done(owner).unwrap();
        assert_eq!(queue.pop().unwrap().unwrap().task_type, "t-low");
        queue.done(owner).unwrap();
        assert!(queue.pop().unwrap().is_none());
    }
}
