//! Redis implementation of [`DeliveryStore`].
//!
//! Layout under a configurable prefix:
//! - `{prefix}:active` — sorted set of destination keys the drainer walks.
//! - `{prefix}:{dest}:bulk` / `{prefix}:{dest}:high` — item sorted sets,
//!   scored by push timestamp (epoch microseconds). Members are
//!   `<seq>:<json>`: a zero-padded per-destination sequence keeps identical
//!   payloads distinct in the set and makes equal scores drain FIFO, the
//!   same tiebreaker the in-memory store carries.
//! - `{prefix}:{dest}:seq` — the member-sequence counter.
//! - `{prefix}:tps:{dest}:{second}` — per-second admission counter, expired
//!   by Redis shortly after the second passes.

use chrono::{DateTime, Utc};
use redis::{Client, Commands, Connection, Script};

use crate::delivery::{DeliveryStore, Destination, Tier};
use crate::store::QueueError;

use super::{conn_err, store_err};

/// Enqueue a batch, then (re-)mark the destination active only while the
/// current second's window is under the cap — an over-cap destination drops
/// out of the index so the drainer skips it without polling.
const PUSH: &str = r#"
local count = tonumber(redis.call("GET", KEYS[3])) or 0
for i = 3, #ARGV, 2 do
  local seq = redis.call("INCR", KEYS[4])
  redis.call("ZADD", KEYS[2], ARGV[i], string.format("%020d:%s", seq, ARGV[i + 1]))
end
if count < tonumber(ARGV[2]) then
  redis.call("ZADD", KEYS[1], 0, ARGV[1])
else
  redis.call("ZREM", KEYS[1], ARGV[1])
end
return 1
"#;

/// Count one admitted transaction; hitting the cap deactivates the
/// destination for the remainder of the second.
const RECORD_SEND: &str = r#"
local count = redis.call("INCR", KEYS[2])
redis.call("EXPIRE", KEYS[2], 3)
if count >= tonumber(ARGV[2]) then
  redis.call("ZREM", KEYS[1], ARGV[1])
end
return count
"#;

const CLEAR: &str = r#"
redis.call("DEL", KEYS[2], KEYS[3], KEYS[4])
redis.call("ZREM", KEYS[1], ARGV[1])
return 1
"#;

/// Redis-backed delivery store.
pub struct RedisDeliveryStore {
    client: Client,
    prefix: String,
    push_script: Script,
    send_script: Script,
    clear_script: Script,
}

impl RedisDeliveryStore {
    pub fn new(url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, QueueError> {
        let client = Client::open(url.as_ref()).map_err(conn_err)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            push_script: Script::new(PUSH),
            send_script: Script::new(RECORD_SEND),
            clear_script: Script::new(CLEAR),
        })
    }

    fn conn(&self) -> Result<Connection, QueueError> {
        self.client.get_connection().map_err(conn_err)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.prefix)
    }

    fn tier_key(&self, dest: &Destination, tier: Tier) -> String {
        let suffix = match tier {
            Tier::Bulk => "bulk",
            Tier::High => "high",
        };
        format!("{}:{}:{}", self.prefix, dest.key(), suffix)
    }

    fn seq_key(&self, dest: &Destination) -> String {
        format!("{}:{}:seq", self.prefix, dest.key())
    }

    fn counter_key(&self, dest: &Destination, now: DateTime<Utc>) -> String {
        format!("{}:tps:{}:{}", self.prefix, dest.key(), now.timestamp())
    }
}

impl DeliveryStore for RedisDeliveryStore {
    fn push(
        &self,
        dest: &Destination,
        tier: Tier,
        items: &[serde_json::Value],
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let score = now.timestamp_micros();

        let mut invocation = self.push_script.prepare_invoke();
        invocation
            .key(self.active_key())
            .key(self.tier_key(dest, tier))
            .key(self.counter_key(dest, now))
            .key(self.seq_key(dest))
            .arg(dest.key())
            .arg(dest.cap_per_second());
        for item in items {
            invocation.arg(score).arg(serde_json::to_string(item)?);
        }
        invocation.invoke::<i64>(&mut conn).map_err(store_err)?;
        Ok(())
    }

    fn record_send(&self, dest: &Destination, now: DateTime<Utc>) -> Result<u32, QueueError> {
        let mut conn = self.conn()?;
        let count: i64 = self
            .send_script
            .key(self.active_key())
            .key(self.counter_key(dest, now))
            .arg(dest.key())
            .arg(dest.cap_per_second())
            .invoke(&mut conn)
            .map_err(store_err)?;
        Ok(count.max(0) as u32)
    }

    fn clear(&self, dest: &Destination) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        self.clear_script
            .key(self.active_key())
            .key(self.tier_key(dest, Tier::Bulk))
            .key(self.tier_key(dest, Tier::High))
            .key(self.seq_key(dest))
            .arg(dest.key())
            .invoke::<i64>(&mut conn)
            .map_err(store_err)?;
        Ok(())
    }

    fn window_count(&self, dest: &Destination, now: DateTime<Utc>) -> Result<u32, QueueError> {
        let mut conn = self.conn()?;
        let count: Option<u32> = conn
            .get(self.counter_key(dest, now))
            .map_err(store_err)?;
        Ok(count.unwrap_or(0))
    }

    fn is_active(&self, dest: &Destination) -> Result<bool, QueueError> {
        let mut conn = self.conn()?;
        let score: Option<f64> = conn
            .zscore(self.active_key(), dest.key())
            .map_err(store_err)?;
        Ok(score.is_some())
    }

    fn active_destinations(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn()?;
        conn.zrange(self.active_key(), 0, -1).map_err(store_err)
    }

    fn queued(&self, dest: &Destination, tier: Tier) -> Result<usize, QueueError> {
        let mut conn = self.conn()?;
        conn.zcard(self.tier_key(dest, tier)).map_err(store_err)
    }

    fn queued_items(
        &self,
        dest: &Destination,
        tier: Tier,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        let mut conn = self.conn()?;
        let raw: Vec<String> = conn
            .zrange(self.tier_key(dest, tier), 0, -1)
            .map_err(store_err)?;
        raw.iter()
            .map(|member| {
                // Members are `<seq>:<json>`; the payload starts after the
                // first colon.
                let body = member
                    .split_once(':')
                    .map(|(_, body)| body)
                    .ok_or_else(|| {
                        QueueError::Store(format!("malformed queue member: {member}"))
                    })?;
                serde_json::from_str(body).map_err(QueueError::from)
            })
            .collect()
    }
}
