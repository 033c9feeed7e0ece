//! Rate-limited delivery queue for outbound messages.
//!
//! Each destination gets two priority tiers (bulk, high) and a per-second
//! transactions ceiling. The active-destinations index is what the external
//! drain process walks: a destination at its cap simply isn't listed, so a
//! capped destination is skipped without polling it. No pop/done pair lives
//! here — drain order (high before bulk, FIFO within a tier) is the
//! consumer's contract, exposed read-only.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use flowline_core::{DestinationId, DomainError, DomainResult};

use crate::store::QueueError;

/// Delivery tier. High is drained before bulk for the same destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Bulk,
    High,
}

/// A delivery destination plus its declared throughput ceiling.
///
/// The queue is keyed by `destination:cap`, so reconfiguring a destination's
/// throughput addresses a fresh queue — `clear` the old key when doing so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    id: DestinationId,
    cap_per_second: u32,
}

impl Destination {
    pub fn new(id: DestinationId, cap_per_second: u32) -> DomainResult<Self> {
        if cap_per_second == 0 {
            return Err(DomainError::validation(
                "destination throughput cap must be positive",
            ));
        }
        Ok(Self { id, cap_per_second })
    }

    pub fn id(&self) -> DestinationId {
        self.id
    }

    pub fn cap_per_second(&self) -> u32 {
        self.cap_per_second
    }

    /// Store key for this destination+throughput pair.
    pub fn key(&self) -> String {
        format!("{}:{}", self.id, self.cap_per_second)
    }
}

/// Atomic operations over per-destination delivery queues.
pub trait DeliveryStore: Send + Sync {
    /// Enqueue items under the tier, scored by `now`; (re-)mark the
    /// destination active unless its rate window is already at the cap.
    fn push(
        &self,
        dest: &Destination,
        tier: Tier,
        items: &[serde_json::Value],
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Record one admitted transaction in the current second's window;
    /// reaching the cap deactivates the destination for the rest of the
    /// second. Returns the new window count.
    fn record_send(&self, dest: &Destination, now: DateTime<Utc>) -> Result<u32, QueueError>;

    /// Drop both tiers and deactivate (reconfiguration/disable).
    fn clear(&self, dest: &Destination) -> Result<(), QueueError>;

    /// Admitted-transaction count for the current second.
    fn window_count(&self, dest: &Destination, now: DateTime<Utc>) -> Result<u32, QueueError>;

    fn is_active(&self, dest: &Destination) -> Result<bool, QueueError>;

    /// Keys of destinations currently marked active.
    fn active_destinations(&self) -> Result<Vec<String>, QueueError>;

    /// Queued item count for one tier.
    fn queued(&self, dest: &Destination, tier: Tier) -> Result<usize, QueueError>;

    /// Queued items for one tier in drain (FIFO) order.
    fn queued_items(
        &self,
        dest: &Destination,
        tier: Tier,
    ) -> Result<Vec<serde_json::Value>, QueueError>;
}

impl<S> DeliveryStore for Arc<S>
where
    S: DeliveryStore + ?Sized,
{
    fn push(
        &self,
        dest: &Destination,
        tier: Tier,
        items: &[serde_json::Value],
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        (**self).push(dest, tier, items, now)
    }

    fn record_send(&self, dest: &Destination, now: DateTime<Utc>) -> Result<u32, QueueError> {
        (**self).record_send(dest, now)
    }

    fn clear(&self, dest: &Destination) -> Result<(), QueueError> {
        (**self).clear(dest)
    }

    fn window_count(&self, dest: &Destination, now: DateTime<Utc>) -> Result<u32, QueueError> {
        (**self).window_count(dest, now)
    }

    fn is_active(&self, dest: &Destination) -> Result<bool, QueueError> {
        (**self).is_active(dest)
    }

    fn active_destinations(&self) -> Result<Vec<String>, QueueError> {
        (**self).active_destinations()
    }

    fn queued(&self, dest: &Destination, tier: Tier) -> Result<usize, QueueError> {
        (**self).queued(dest, tier)
    }

    fn queued_items(
        &self,
        dest: &Destination,
        tier: Tier,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        (**self).queued_items(dest, tier)
    }
}

/// Caller-facing handle over a delivery store.
#[derive(Debug, Clone)]
pub struct DeliveryQueue<S> {
    store: S,
}

impl<S> DeliveryQueue<S>
where
    S: DeliveryStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn push(
        &self,
        dest: &Destination,
        tier: Tier,
        items: &[serde_json::Value],
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.store.push(dest, tier, items, now)?;
        debug!(
            destination = %dest.key(),
            ?tier,
            count = items.len(),
            "queued outbound items"
        );
        Ok(())
    }

    pub fn record_send(&self, dest: &Destination, now: DateTime<Utc>) -> Result<u32, QueueError> {
        self.store.record_send(dest, now)
    }

    pub fn clear(&self, dest: &Destination) -> Result<(), QueueError> {
        debug!(destination = %dest.key(), "clearing destination");
        self.store.clear(dest)
    }

    pub fn window_count(&self, dest: &Destination, now: DateTime<Utc>) -> Result<u32, QueueError> {
        self.store.window_count(dest, now)
    }

    pub fn is_active(&self, dest: &Destination) -> Result<bool, QueueError> {
        self.store.is_active(dest)
    }

    pub fn active_destinations(&self) -> Result<Vec<String>, QueueError> {
        self.store.active_destinations()
    }

    pub fn queued(&self, dest: &Destination, tier: Tier) -> Result<usize, QueueError> {
        self.store.queued(dest, tier)
    }

    pub fn queued_items(
        &self,
        dest: &Destination,
        tier: Tier,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        self.store.queued_items(dest, tier)
    }
}

#[derive(Debug, Default)]
struct DestState {
    bulk: BTreeMap<(i64, u64), serde_json::Value>,
    high: BTreeMap<(i64, u64), serde_json::Value>,
    window_sec: i64,
    window_count: u32,
    active: bool,
    seq: u64,
}

impl DestState {
    /// Reset the window when the epoch second has moved on. The counter is
    /// never deleted; it just stops mattering.
    fn roll_window(&mut self, sec: i64) {
        if self.window_sec != sec {
            self.window_sec = sec;
            self.window_count = 0;
        }
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut BTreeMap<(i64, u64), serde_json::Value> {
        match tier {
            Tier::Bulk => &mut self.bulk,
            Tier::High => &mut self.high,
        }
    }

    fn tier(&self, tier: Tier) -> &BTreeMap<(i64, u64), serde_json::Value> {
        match tier {
            Tier::Bulk => &self.bulk,
            Tier::High => &self.high,
        }
    }
}

/// In-memory implementation of [`DeliveryStore`] for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeliveryStore {
    dests: Mutex<HashMap<String, DestState>>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, DestState>>, QueueError> {
        self.dests
            .lock()
            .map_err(|_| QueueError::Store("delivery store lock poisoned".to_string()))
    }
}

impl DeliveryStore for InMemoryDeliveryStore {
    fn push(
        &self,
        dest: &Destination,
        tier: Tier,
        items: &[serde_json::Value],
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut dests = self.lock()?;
        let state = dests.entry(dest.key()).or_default();
        state.roll_window(now.timestamp());

        let score = now.timestamp_micros();
        for item in items {
            state.seq += 1;
            let seq = state.seq;
            state.tier_mut(tier).insert((score, seq), item.clone());
        }

        state.active = state.window_count < dest.cap_per_second();
        Ok(())
    }

    fn record_send(&self, dest: &Destination, now: DateTime<Utc>) -> Result<u32, QueueError> {
        let mut dests = self.lock()?;
        let state = dests.entry(dest.key()).or_default();
        state.roll_window(now.timestamp());

        state.window_count += 1;
        if state.window_count >= dest.cap_per_second() {
            state.active = false;
        }
        Ok(state.window_count)
    }

    fn clear(&self, dest: &Destination) -> Result<(), QueueError> {
        let mut dests = self.lock()?;
        dests.remove(&dest.key());
        Ok(())
    }

    fn window_count(&self, dest: &Destination, now: DateTime<Utc>) -> Result<u32, QueueError> {
        let dests = self.lock()?;
        Ok(dests
            .get(&dest.key())
            .filter(|state| state.window_sec == now.timestamp())
            .map(|state| state.window_count)
            .unwrap_or(0))
    }

    fn is_active(&self, dest: &Destination) -> Result<bool, QueueError> {
        let dests = self.lock()?;
        Ok(dests.get(&dest.key()).map(|s| s.active).unwrap_or(false))
    }

    fn active_destinations(&self) -> Result<Vec<String>, QueueError> {
        let dests = self.lock()?;
        let mut keys: Vec<String> = dests
            .iter()
            .filter(|(_, state)| state.active)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn queued(&self, dest: &Destination, tier: Tier) -> Result<usize, QueueError> {
        let dests = self.lock()?;
        Ok(dests.get(&dest.key()).map(|s| s.tier(tier).len()).unwrap_or(0))
    }

    fn queued_items(
        &self,
        dest: &Destination,
        tier: Tier,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        let dests = self.lock()?;
        Ok(dests
            .get(&dest.key())
            .map(|s| s.tier(tier).values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn dest(cap: u32) -> Destination {
        Destination::new(DestinationId::new(), cap).unwrap()
    }

    fn at(sec: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(sec, 0).unwrap()
    }

    #[test]
    fn zero_cap_is_rejected() {
        assert!(Destination::new(DestinationId::new(), 0).is_err());
    }

    #[test]
    fn push_marks_destination_active() {
        let store = InMemoryDeliveryStore::new();
        let d = dest(10);

        assert!(!store.is_active(&d).unwrap());
        store
            .push(&d, Tier::Bulk, &[serde_json::json!({"msg": 1})], at(100))
            .unwrap();
        assert!(store.is_active(&d).unwrap());
        assert_eq!(store.queued(&d, Tier::Bulk).unwrap(), 1);
        assert_eq!(store.active_destinations().unwrap(), vec![d.key()]);
    }

    #[test]
    fn reaching_the_cap_deactivates_until_the_next_second() {
        let store = InMemoryDeliveryStore::new();
        let d = dest(2);

        store
            .push(&d, Tier::High, &[serde_json::json!(1), serde_json::json!(2), serde_json::json!(3)], at(100))
            .unwrap();
        assert!(store.is_active(&d).unwrap());

        assert_eq!(store.record_send(&d, at(100)).unwrap(), 1);
        assert!(store.is_active(&d).unwrap());
        assert_eq!(store.record_send(&d, at(100)).unwrap(), 2);
        assert!(!store.is_active(&d).unwrap(), "cap reached within the second");

        // A push within the same capped second must not reactivate.
        store
            .push(&d, Tier::Bulk, &[serde_json::json!(4)], at(100))
            .unwrap();
        assert!(!store.is_active(&d).unwrap());
        assert_eq!(store.window_count(&d, at(100)).unwrap(), 2);

        // Next second: the window resets and a push reactivates.
        assert_eq!(store.window_count(&d, at(101)).unwrap(), 0);
        store
            .push(&d, Tier::Bulk, &[serde_json::json!(5)], at(101))
            .unwrap();
        assert!(store.is_active(&d).unwrap());
    }

    #[test]
    fn tiers_are_separate_and_fifo() {
        let store = InMemoryDeliveryStore::new();
        let d = dest(10);

        store
            .push(&d, Tier::Bulk, &[serde_json::json!("b1"), serde_json::json!("b2")], at(50))
            .unwrap();
        store
            .push(&d, Tier::High, &[serde_json::json!("h1")], at(51))
            .unwrap();
        store
            .push(&d, Tier::Bulk, &[serde_json::json!("b3")], at(52))
            .unwrap();

        assert_eq!(
            store.queued_items(&d, Tier::Bulk).unwrap(),
            vec![serde_json::json!("b1"), serde_json::json!("b2"), serde_json::json!("b3")]
        );
        assert_eq!(
            store.queued_items(&d, Tier::High).unwrap(),
            vec![serde_json::json!("h1")]
        );
    }

    #[test]
    fn clear_drops_both_tiers_and_deactivates() {
        let store = InMemoryDeliveryStore::new();
        let d = dest(5);

        store.push(&d, Tier::Bulk, &[serde_json::json!(1)], at(10)).unwrap();
        store.push(&d, Tier::High, &[serde_json::json!(2)], at(10)).unwrap();
        store.clear(&d).unwrap();

        assert!(!store.is_active(&d).unwrap());
        assert_eq!(store.queued(&d, Tier::Bulk).unwrap(), 0);
        assert_eq!(store.queued(&d, Tier::High).unwrap(), 0);
        assert!(store.active_destinations().unwrap().is_empty());
    }

    #[test]
    fn same_destination_with_different_caps_is_a_different_queue() {
        let id = DestinationId::new();
        let slow = Destination::new(id, 1).unwrap();
        let fast = Destination::new(id, 100).unwrap();
        let store = InMemoryDeliveryStore::new();

        store.push(&slow, Tier::Bulk, &[serde_json::json!(1)], at(10)).unwrap();
        assert_eq!(store.queued(&slow, Tier::Bulk).unwrap(), 1);
        assert_eq!(store.queued(&fast, Tier::Bulk).unwrap(), 0);
    }
}
