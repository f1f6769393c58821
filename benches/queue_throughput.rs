//! Throughput benchmarks for the queue hot path.

use std::collections::HashMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use sched_core::clock::NANOS_PER_MS;
use sched_core::{
    InferenceRequest, ManualClock, Payload, PriorityQueue, QueuePolicy, TimeoutAction,
};

fn enqueue_dequeue(c: &mut Criterion) {
    c.bench_function("enqueue_dequeue_1k_4_levels", |b| {
        b.iter(|| {
            let clock = Arc::new(ManualClock::starting_at(NANOS_PER_MS));
            let mut queue =
                PriorityQueue::new(QueuePolicy::default(), 4, &HashMap::new(), clock);
            for id in 0..1_000u64 {
                queue
                    .enqueue((id % 4 + 1) as u32, Payload::new(InferenceRequest::new(id)))
                    .unwrap();
            }
            while queue.dequeue().is_ok() {}
            black_box(queue.size())
        });
    });
}

fn policy_scan_with_expirations(c: &mut Criterion) {
    c.bench_function("apply_policy_1k_expired", |b| {
        b.iter(|| {
            let clock = Arc::new(ManualClock::starting_at(NANOS_PER_MS));
            let policy = QueuePolicy {
                default_timeout_ms: 1,
                timeout_action: TimeoutAction::Reject,
                ..QueuePolicy::default()
            };
            let mut queue = PriorityQueue::new(policy, 0, &HashMap::new(), clock.clone());
            for id in 0..1_000u64 {
                queue
                    .enqueue(0, Payload::new(InferenceRequest::new(id)))
                    .unwrap();
            }
            clock.advance_ms(10);
            queue.reset_cursor();
            black_box(queue.apply_policy_at_cursor())
        });
    });
}

criterion_group!(benches, enqueue_dequeue, policy_scan_with_expirations);
criterion_main!(benches);
