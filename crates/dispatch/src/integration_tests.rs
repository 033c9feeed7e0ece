//! Integration tests for the full task-distribution pipeline.
//!
//! Tests: producers → FairQueue → Foreman/workers → handlers → DeliveryQueue
//!
//! Verifies:
//! - Every pushed task executes exactly once across a multi-worker pool
//! - Handler-driven retries re-enter the queue and respect the type's cap
//! - Outbound handlers feed the rate-limited delivery queue
//! - Cron promotion lands work in a queue the pool then drains

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::Utc;

    use flowline_core::{DestinationId, OwnerId};
    use flowline_queue::{
        DeliveryQueue, Destination, FairQueue, InMemoryDeliveryStore, InMemoryQueueStore,
        Priority, Tier,
    };

    use crate::cron::{CronRunner, CronTask};
    use crate::pool::{Foreman, PoolConfig};
    use crate::registry::TaskRegistry;

    fn batch_queue() -> FairQueue<Arc<InMemoryQueueStore>> {
        FairQueue::new(Arc::new(InMemoryQueueStore::new()), "batch")
    }

    fn fast_config(name: &str, workers: usize) -> PoolConfig {
        PoolConfig::default()
            .with_name(name)
            .with_workers(workers)
            .with_poll_interval(Duration::from_millis(10))
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
    fn every_task_executes_exactly_once_across_workers() {
        // Same logging setup production wiring uses; no-op when repeated.
        flowline_observability::init();

        let queue = batch_queue();
        let owners: Vec<OwnerId> = (0..3).map(|_| OwnerId::new()).collect();

        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let mut registry = TaskRegistry::new();
        registry.register("start_flow", Duration::from_secs(5), 1, move |task, _| {
            let n = task.payload["n"].as_i64().unwrap_or(-1);
            seen_clone.lock().unwrap().push(n);
            Ok(())
        });

        for n in 0..30i64 {
            let owner = owners[(n % 3) as usize];
            queue
                .push("start_flow", owner, serde_json::json!({"n": n}), Priority::Default)
                .unwrap();
        }

        let handle =
            Foreman::new(queue.clone(), Arc::new(registry)).start(fast_config("pipeline", 4));
        assert!(wait_until(|| seen.lock().unwrap().len() == 30));
        handle.shutdown();

        let mut got = seen.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, (0..30).collect::<Vec<i64>>());

        assert_eq!(queue.size().unwrap(), 0);
        for owner in owners {
            assert_eq!(queue.in_flight(owner).unwrap(), 0);
        }
    }

    #[test]
    fn failed_tasks_retry_until_the_cap_then_succeed() {
        let queue = batch_queue();
        let owner = OwnerId::new();

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let retry_queue = queue.clone();

        let mut registry = TaskRegistry::new();
        // Fails twice, succeeds on the third attempt. The handler owns its
        // retry policy: on failure it re-pushes the bumped envelope itself,
        // while the attempt cap still allows.
        registry.register("flaky_fire", Duration::from_secs(5), 3, move |task, _| {
            let attempt = attempts_clone.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                if task.error_count + 1 < 3 {
                    retry_queue
                        .push_task(&task.retried(), Priority::Default)
                        .expect("re-push");
                }
                anyhow::bail!("transient failure on attempt {attempt}");
            }
            Ok(())
        });

        queue
            .push("flaky_fire", owner, serde_json::json!({"contact": 7}), Priority::Default)
            .unwrap();

        let handle = Foreman::new(queue.clone(), Arc::new(registry)).start(fast_config("retry", 1));
        assert!(wait_until(|| handle.stats().processed == 3));
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(queue.size().unwrap(), 0);

        assert_eq!(stats.failed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(queue.in_flight(owner).unwrap(), 0);
    }

    #[test]
    fn outbound_handler_feeds_the_delivery_queue() {
        let queue = batch_queue();
        let owner = OwnerId::new();

        let delivery = DeliveryQueue::new(Arc::new(InMemoryDeliveryStore::new()));
        let dest = Destination::new(DestinationId::new(), 10).unwrap();

        let delivery_clone = delivery.clone();
        let mut registry = TaskRegistry::new();
        registry.register("send_broadcast", Duration::from_secs(5), 1, move |task, _| {
            let items: Vec<serde_json::Value> = task.payload["msgs"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            delivery_clone.push(&dest, Tier::Bulk, &items, Utc::now())?;
            Ok(())
        });

        queue
            .push(
                "send_broadcast",
                owner,
                serde_json::json!({"msgs": [{"to": "a"}, {"to": "b"}]}),
                Priority::Default,
            )
            .unwrap();

        let handle =
            Foreman::new(queue.clone(), Arc::new(registry)).start(fast_config("outbound", 1));
        assert!(wait_until(|| handle.stats().succeeded == 1));
        handle.shutdown();

        assert!(delivery.is_active(&dest).unwrap());
        assert_eq!(delivery.queued(&dest, Tier::Bulk).unwrap(), 2);
        assert_eq!(
            delivery.queued_items(&dest, Tier::Bulk).unwrap(),
            vec![serde_json::json!({"to": "a"}), serde_json::json!({"to": "b"})]
        );
    }

    #[test]
    fn cron_promotion_lands_in_the_queue_and_gets_dispatched() {
        let queue = batch_queue();
        let owner = OwnerId::new();

        struct FirePromoter {
            queue: FairQueue<Arc<InMemoryQueueStore>>,
            owner: OwnerId,
            fired: AtomicU32,
        }

        impl CronTask for FirePromoter {
            fn name(&self) -> &str {
                "promote-fires"
            }

            fn interval(&self) -> Duration {
                Duration::from_millis(10)
            }

            fn run(&self) -> anyhow::Result<()> {
                // Promote one due fire per sweep, three total.
                if self.fired.fetch_add(1, Ordering::SeqCst) < 3 {
                    self.queue.push(
                        "contact_fire",
                        self.owner,
                        serde_json::json!({}),
                        Priority::Default,
                    )?;
                }
                Ok(())
            }
        }

        let executed = Arc::new(AtomicU32::new(0));
        let executed_clone = executed.clone();
        let mut registry = TaskRegistry::new();
        registry.register("contact_fire", Duration::from_secs(5), 1, move |_, _| {
            executed_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let cron = CronRunner::spawn(vec![Arc::new(FirePromoter {
            queue: queue.clone(),
            owner,
            fired: AtomicU32::new(0),
        })]);
        let pool =
            Foreman::new(queue.clone(), Arc::new(registry)).start(fast_config("promoted", 2));

        assert!(wait_until(|| executed.load(Ordering::SeqCst) >= 3));
        cron.shutdown();
        pool.shutdown();

        assert_eq!(queue.in_flight(owner).unwrap(), 0);
    }

    #[test]
    fn paused_owner_work_waits_out_the_quarantine() {
        let queue = batch_queue();
        let quarantined = OwnerId::new();
        let healthy = OwnerId::new();

        let executed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let executed_clone = executed.clone();

        let mut registry = TaskRegistry::new();
        registry.register("work", Duration::from_secs(5), 1, move |task, _| {
            executed_clone
                .lock()
                .unwrap()
                .push(task.payload["who"].as_str().unwrap_or("?").to_string());
            Ok(())
        });

        queue.pause(quarantined).unwrap();
        queue
            .push("work", quarantined, serde_json::json!({"who": "quarantined"}), Priority::High)
            .unwrap();
        queue
            .push("work", healthy, serde_json::json!({"who": "healthy"}), Priority::Default)
            .unwrap();

        let handle = Foreman::new(queue.clone(), Arc::new(registry)).start(fast_config("adm", 2));

        assert!(wait_until(|| executed.lock().unwrap().len() == 1));
        assert_eq!(executed.lock().unwrap()[0], "healthy");
        assert_eq!(queue.size().unwrap(), 1, "quarantined work is retained, not run");

        queue.resume(quarantined).unwrap();
        assert!(wait_until(|| executed.lock().unwrap().len() == 2));
        handle.shutdown();

        assert_eq!(executed.lock().unwrap()[1], "quarantined");
    }
}
