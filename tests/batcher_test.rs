//! End-to-end batching through the public scheduler API.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use sched_core::clock::NANOS_PER_MS;
use sched_core::{
    InferenceRequest, QueuePolicy, RequestBatch, ScheduleError, Scheduler, SchedulerConfig,
    TimeoutAction,
};

const WAIT: Duration = Duration::from_secs(2);

fn held_open_config() -> SchedulerConfig {
    // a large delay window so partial batches stay queued until the
    // preferred size is reached
    SchedulerConfig {
        preferred_batch_size: 3,
        max_queue_delay_ns: 60_000 * NANOS_PER_MS,
        ..SchedulerConfig::default()
    }
}

async fn recv_batch(rx: &mut mpsc::UnboundedReceiver<RequestBatch>) -> RequestBatch {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn batch_seals_at_preferred_size() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::spawn(held_open_config(), tx);

    for id in 1..=3 {
        scheduler.enqueue(0, InferenceRequest::new(id)).await.unwrap();
    }

    let batch = recv_batch(&mut rx).await;
    let ids: Vec<u64> = batch.payloads.iter().map(|p| p.request.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(scheduler.queue_depth().await, 0);

    let snapshot = scheduler.metrics();
    assert_eq!(snapshot.enqueued, 3);
    assert_eq!(snapshot.batches_sealed, 1);
    assert_eq!(snapshot.payloads_batched, 3);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn partial_batch_seals_when_delay_window_closes() {
    let config = SchedulerConfig {
        preferred_batch_size: 4,
        max_queue_delay_ns: 50 * NANOS_PER_MS,
        ..SchedulerConfig::default()
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::spawn(config, tx);

    scheduler.enqueue(0, InferenceRequest::new(1)).await.unwrap();

    let batch = recv_batch(&mut rx).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.payloads[0].request.id, 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn full_queue_rejects_enqueue() {
    let config = SchedulerConfig {
        default_policy: QueuePolicy {
            max_queue_size: 1,
            ..QueuePolicy::default()
        },
        ..held_open_config()
    };
    let (tx, _rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::spawn(config, tx);

    scheduler.enqueue(0, InferenceRequest::new(1)).await.unwrap();
    let err = scheduler
        .enqueue(0, InferenceRequest::new(2))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::QueueFull { current: 1, max: 1 }));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn expired_request_completes_with_deadline_error() {
    let config = SchedulerConfig {
        default_policy: QueuePolicy {
            default_timeout_ms: 20,
            timeout_action: TimeoutAction::Reject,
            ..QueuePolicy::default()
        },
        ..held_open_config()
    };
    let (tx, _rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::spawn(config, tx);

    let completion = scheduler.enqueue(0, InferenceRequest::new(1)).await.unwrap();
    let result = timeout(WAIT, completion).await.unwrap().unwrap();
    assert!(matches!(result, Err(ScheduleError::DeadlineExceeded { .. })));
    assert_eq!(scheduler.metrics().rejected, 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn delayed_request_joins_a_later_batch() {
    let config = SchedulerConfig {
        default_policy: QueuePolicy {
            default_timeout_ms: 20,
            timeout_action: TimeoutAction::Delay,
            ..QueuePolicy::default()
        },
        ..held_open_config()
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::spawn(config, tx);

    scheduler.enqueue(0, InferenceRequest::new(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    scheduler.enqueue(0, InferenceRequest::new(2)).await.unwrap();
    scheduler.enqueue(0, InferenceRequest::new(3)).await.unwrap();

    // the delayed request still ships, after the live ones at its level
    let batch = recv_batch(&mut rx).await;
    let ids: Vec<u64> = batch.payloads.iter().map(|p| p.request.id).collect();
    assert_eq!(ids, vec![2, 3, 1]);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn shutdown_completes_queued_requests() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::spawn(held_open_config(), tx);

    let completion = scheduler.enqueue(0, InferenceRequest::new(1)).await.unwrap();
    scheduler.shutdown().await;

    let result = timeout(WAIT, completion).await.unwrap().unwrap();
    assert_eq!(result, Err(ScheduleError::ShuttingDown));
    assert_eq!(scheduler.metrics().abandoned, 1);

    let err = scheduler
        .enqueue(0, InferenceRequest::new(2))
        .await
        .unwrap_err();
    assert_eq!(err, ScheduleError::ShuttingDown);
}

#[tokio::test]
async fn higher_priority_level_ships_first() {
    let config = SchedulerConfig {
        priority_levels: 2,
        preferred_batch_size: 2,
        max_queue_delay_ns: 60_000 * NANOS_PER_MS,
        max_batch_size: 2,
        ..SchedulerConfig::default()
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::spawn(config, tx);

    scheduler.enqueue(2, InferenceRequest::new(1)).await.unwrap();
    scheduler.enqueue(2, InferenceRequest::new(2)).await.unwrap();
    scheduler.enqueue(1, InferenceRequest::new(3)).await.unwrap();
    scheduler.enqueue(1, InferenceRequest::new(4)).await.unwrap();

    // whichever batch seals first must not mix levels, and level 1 ships
    // before level 2 once both are full
    let first = recv_batch(&mut rx).await;
    let second = recv_batch(&mut rx).await;
    let firsts: Vec<u64> = first.payloads.iter().map(|p| p.request.id).collect();
    let seconds: Vec<u64> = second.payloads.iter().map(|p| p.request.id).collect();
    assert!(firsts == vec![1, 2] || firsts == vec![3, 4]);
    if firsts == vec![1, 2] {
        assert_eq!(seconds, vec![3, 4]);
    } else {
        assert_eq!(seconds, vec![1, 2]);
    }

    scheduler.shutdown().await;
}
