use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use flowline_core::OwnerId;
use flowline_queue::{FairQueue, InMemoryQueueStore, Priority};
use std::sync::Arc;

fn bench_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("fair_queue_push");

    for owners in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(owners as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(owners),
            &owners,
            |b, &owners| {
                let queue = FairQueue::new(Arc::new(InMemoryQueueStore::new()), "bench");
                let ids: Vec<OwnerId> = (0..owners).map(|_| OwnerId::new()).collect();

                b.iter(|| {
                    for owner in &ids {
                        queue
                            .push(
                                "bench_task",
                                *owner,
                                serde_json::json!({"n": 1}),
                                Priority::Default,
                            )
                            .unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_pop_done_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("fair_queue_pop_done");

    for owners in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(owners as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(owners),
            &owners,
            |b, &owners| {
                let queue = FairQueue::new(Arc::new(InMemoryQueueStore::new()), "bench");
                let ids: Vec<OwnerId> = (0..owners).map(|_| OwnerId::new()).collect();

                b.iter(|| {
                    for owner in &ids {
                        queue
                            .push(
                                "bench_task",
                                *owner,
                                serde_json::json!({"n": 1}),
                                Priority::Default,
                            )
                            .unwrap();
                    }
                    for _ in 0..owners {
                        let task = queue.pop().unwrap().unwrap();
                        queue.done(black_box(task.owner_id)).unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_push, bench_pop_done_cycle);
criterion_main!(benches);
