//! sched-core - priority-aware request scheduling for inference serving.
//!
//! Accepts inference requests for a single model instance, holds them in
//! prioritized queues with per-request deadlines, forms dynamic batches
//! under shape-compatibility constraints, and releases sealed batches to a
//! downstream runner.
//!
//! # Components
//!
//! - [`PolicyQueue`]: one level's FIFO with its timeout/size policy.
//! - [`PriorityQueue`]: per-level policy queues plus the pending-batch
//!   cursor.
//! - [`batcher`]: the batch-formation loop driving the cursor.
//! - [`Scheduler`]: the assembly, wiring config, queue, and batcher task.
//!
//! # Ordering guarantees
//!
//! Within one level, FIFO. Across levels, strict priority: a lower-numbered
//! level is served before any higher-numbered one while nonempty. Delayed
//! payloads at a level are served only after its live queue is empty.
//! Rejected payloads never re-enter batching.

pub mod batcher;
pub mod clock;
pub mod config;
pub mod error;
pub mod payload;
pub mod policy_queue;
pub mod priority_queue;
pub mod shape;
pub mod telemetry;

use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use batcher::{BatchRx, BatchTx, RequestBatch};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{QueuePolicy, SchedulerConfig, TimeoutAction};
pub use error::ScheduleError;
pub use payload::{CompletionRx, InferenceRequest, Payload, RequestInput};
pub use policy_queue::PolicyQueue;
pub use priority_queue::PriorityQueue;
pub use shape::{PeekShapeFn, PendingBatchShapes};
pub use telemetry::{init_logging, LogConfig, LogFormat, MetricsSnapshot, SchedulerMetrics};

use batcher::BatchBuilder;

/// A scheduler instance for one model: the priority queue plus its batcher
/// task. Sealed batches arrive on the runner sink passed at construction.
pub struct Scheduler {
    queue: Arc<Mutex<PriorityQueue>>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    batcher: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<SchedulerMetrics>,
}

/// Peek function used when none is configured. Only reachable when the
/// shape-enforcement map marks an input as a shape tensor.
fn unconfigured_peek() -> PeekShapeFn {
    Arc::new(|_, input, _| Err(ScheduleError::ShapePeek(input.name.clone())))
}

impl Scheduler {
    /// Create the scheduler and spawn its batcher task with a wall clock
    /// and no shape-tensor peek function.
    pub fn spawn(config: SchedulerConfig, runner: BatchTx) -> Self {
        Self::spawn_with(
            config,
            runner,
            Arc::new(MonotonicClock::new()),
            unconfigured_peek(),
            0,
        )
    }

    /// Create the scheduler with explicit collaborators: clock, peek
    /// function, and the runner id passed through to it.
    pub fn spawn_with(
        config: SchedulerConfig,
        runner: BatchTx,
        clock: Arc<dyn Clock>,
        peek: PeekShapeFn,
        runner_id: u64,
    ) -> Self {
        let queue = Arc::new(Mutex::new(PriorityQueue::from_config(&config, clock.clone())));
        let notify = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(SchedulerMetrics::new());

        let builder = BatchBuilder::new(
            queue.clone(),
            &config,
            clock,
            runner,
            peek,
            runner_id,
            metrics.clone(),
        );
        let handle = batcher::spawn_batcher(builder, notify.clone(), shutdown.clone());

        Self {
            queue,
            notify,
            shutdown,
            batcher: Mutex::new(Some(handle)),
            metrics,
        }
    }

    /// Enqueue a request at the given priority level (lower = higher
    /// priority). Returns the completion receiver carrying the request's
    /// terminal queue status.
    pub async fn enqueue(
        &self,
        level: u32,
        request: InferenceRequest,
    ) -> Result<CompletionRx, ScheduleError> {
        if self.shutdown.is_cancelled() {
            return Err(ScheduleError::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        let payload = Payload::new(request).with_completion(tx);
        let depth = {
            let mut queue = self.queue.lock().await;
            queue.enqueue(level, payload)?;
            queue.size()
        };
        self.metrics.record_enqueued(depth);
        self.notify.notify_one();
        Ok(rx)
    }

    /// Current live + delayed payload count across all levels.
    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.size()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cooperative shutdown: stop the batcher, harvest rejected payloads,
    /// and complete everything still queued with a shutdown error.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.batcher.lock().await.take() {
            if handle.await.is_err() {
                tracing::error!("batcher task failed during shutdown");
            }
        }
    }
}
