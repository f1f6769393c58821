//! Batch formation loop: claim compatible payloads, seal, hand to runner.
//!
//! A single batcher task drives the cursor. The ingress side enqueues and
//! notifies; the batcher forms batches under the queue mutex and releases
//! sealed batches to the runner sink. Rejected payloads are completed with
//! a deadline error as they are harvested.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, NANOS_PER_MS};
use crate::config::SchedulerConfig;
use crate::error::ScheduleError;
use crate::payload::Payload;
use crate::priority_queue::PriorityQueue;
use crate::shape::{
    compare_with_pending_shape, init_pending_shape, PeekShapeFn, PendingBatchShapes,
};
use crate::telemetry::SchedulerMetrics;

/// Sender half of the runner sink.
pub type BatchTx = mpsc::UnboundedSender<RequestBatch>;
/// Receiver half of the runner sink.
pub type BatchRx = mpsc::UnboundedReceiver<RequestBatch>;

/// A sealed batch of payloads bound for the runner.
#[derive(Debug)]
pub struct RequestBatch {
    pub payloads: Vec<Payload>,
    /// Summed request batch sizes.
    pub total_batch_size: usize,
}

impl RequestBatch {
    pub fn new(payloads: Vec<Payload>) -> Self {
        let total_batch_size = payloads.iter().map(|p| p.request.batch_size).sum();
        Self { payloads, total_batch_size }
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

/// What one pass over the queue produced.
struct TickResult {
    sealed: Option<RequestBatch>,
    rejected: Vec<Payload>,
    /// When holding a partial batch open: the absolute time to recheck.
    wake_at_ns: Option<u64>,
}

/// Outcome of examining the payload under the cursor.
enum Claim {
    /// First member: its shapes define the batch.
    First { shapes: PendingBatchShapes, batch_size: usize },
    /// Compatible member joins the batch.
    Join { batch_size: usize },
    /// Head payload cannot start a batch; fail it out of the queue.
    RejectHead(ScheduleError),
    /// Incompatible or over capacity; stop claiming.
    Stop,
}

/// Forms batches from the priority queue and dispatches them downstream.
pub struct BatchBuilder {
    queue: Arc<Mutex<PriorityQueue>>,
    clock: Arc<dyn Clock>,
    sink: BatchTx,
    peek: PeekShapeFn,
    runner_id: u64,
    max_batch_size: usize,
    preferred_batch_size: usize,
    max_queue_delay_ns: u64,
    enforce_equal_shape_tensors: HashMap<String, bool>,
    metrics: Arc<SchedulerMetrics>,
    /// Shape state of the forming batch; cleared whenever the cursor resets.
    pending_shapes: Option<PendingBatchShapes>,
    /// Summed batch sizes already claimed.
    pending_capacity: usize,
}

impl BatchBuilder {
    pub fn new(
        queue: Arc<Mutex<PriorityQueue>>,
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
        sink: BatchTx,
        peek: PeekShapeFn,
        runner_id: u64,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        Self {
            queue,
            clock,
            sink,
            peek,
            runner_id,
            max_batch_size: config.max_batch_size,
            preferred_batch_size: config.preferred_batch_size,
            max_queue_delay_ns: config.max_queue_delay_ns,
            enforce_equal_shape_tensors: config.enforce_equal_shape_tensors.clone(),
            metrics,
            pending_shapes: None,
            pending_capacity: 0,
        }
    }

    pub(crate) fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    /// One scheduling pass: seal every batch that is ready, then report
    /// either an absolute wake-up time (partial batch held open) or `None`
    /// (idle until the next enqueue).
    pub async fn tick(&mut self) -> Option<u64> {
        let queue = Arc::clone(&self.queue);
        loop {
            let result = {
                let mut queue = queue.lock().await;
                self.form(&mut queue)
            };
            if !result.rejected.is_empty() {
                self.complete_rejected(result.rejected);
            }
            match result.sealed {
                Some(batch) => self.dispatch(batch),
                None => return result.wake_at_ns,
            }
        }
    }

    /// Advance the cursor claiming compatible payloads, then decide whether
    /// to seal, hold, or idle. Runs under the queue mutex.
    fn form(&mut self, queue: &mut PriorityQueue) -> TickResult {
        if !queue.is_cursor_valid() {
            queue.reset_cursor();
            self.pending_shapes = None;
            self.pending_capacity = 0;
        }

        let mut rejected_capacity = 0;
        loop {
            rejected_capacity += queue.apply_policy_at_cursor();
            if queue.pending_batch_count() >= queue.size() {
                break;
            }
            let claim = {
                let Some(candidate) = queue.cursor_candidate() else { break };
                let batch_size = candidate.request.batch_size;
                if queue.pending_batch_count() == 0 {
                    match init_pending_shape(
                        self.runner_id,
                        candidate,
                        &self.enforce_equal_shape_tensors,
                        &self.peek,
                    ) {
                        Ok(shapes) => Claim::First { shapes, batch_size },
                        Err(err) => Claim::RejectHead(err),
                    }
                } else if !self.candidate_compatible(candidate) {
                    Claim::Stop
                } else if self.max_batch_size != 0
                    && self.pending_capacity + batch_size > self.max_batch_size
                {
                    Claim::Stop
                } else {
                    Claim::Join { batch_size }
                }
            };
            match claim {
                Claim::First { shapes, batch_size } => {
                    self.pending_shapes = Some(shapes);
                    self.pending_capacity = batch_size;
                    queue.advance_cursor();
                }
                Claim::Join { batch_size } => {
                    self.pending_capacity += batch_size;
                    queue.advance_cursor();
                }
                Claim::RejectHead(err) => {
                    tracing::warn!(error = %err, "shape peek failed, rejecting request");
                    if let Ok(mut payload) = queue.dequeue() {
                        payload.complete(Err(err));
                    }
                    queue.reset_cursor();
                    self.pending_shapes = None;
                    self.pending_capacity = 0;
                }
                Claim::Stop => break,
            }
        }

        if rejected_capacity != 0 {
            tracing::debug!(capacity = rejected_capacity, "timeout policy reclaimed batch capacity");
        }
        let rejected: Vec<Payload> = queue
            .release_rejected_payloads()
            .into_iter()
            .flatten()
            .collect();

        let pending = queue.pending_batch_count();
        if pending == 0 {
            return TickResult { sealed: None, rejected, wake_at_ns: None };
        }

        let now = self.clock.now_ns();
        let oldest = queue.oldest_enqueue_time_ns();
        if now.saturating_sub(oldest) < self.max_queue_delay_ns
            && pending < self.preferred_batch_size
        {
            // Hold the batch open: wake at the delay expiry or the earliest
            // member deadline, whichever comes first.
            let delay_deadline = oldest.saturating_add(self.max_queue_delay_ns);
            let closest = queue.closest_timeout_ns();
            let wake_at_ns =
                if closest != 0 { closest.min(delay_deadline) } else { delay_deadline };
            return TickResult { sealed: None, rejected, wake_at_ns: Some(wake_at_ns) };
        }

        TickResult { sealed: Some(self.seal(queue, pending)), rejected, wake_at_ns: None }
    }

    fn candidate_compatible(&self, candidate: &Payload) -> bool {
        match &self.pending_shapes {
            Some(shapes) => {
                compare_with_pending_shape(self.runner_id, candidate, &self.peek, shapes)
            }
            None => true,
        }
    }

    /// Dequeue the claimed prefix. The level walk in `dequeue` matches the
    /// cursor's claim order by construction.
    fn seal(&mut self, queue: &mut PriorityQueue, pending: usize) -> RequestBatch {
        let mut payloads = Vec::with_capacity(pending);
        for _ in 0..pending {
            match queue.dequeue() {
                Ok(payload) => payloads.push(payload),
                Err(err) => {
                    tracing::error!(error = %err, "pending batch larger than queue contents");
                    break;
                }
            }
        }
        self.pending_shapes = None;
        self.pending_capacity = 0;
        let batch = RequestBatch::new(payloads);
        self.metrics.record_batch_sealed(batch.len(), queue.size());
        batch
    }

    fn dispatch(&self, batch: RequestBatch) {
        tracing::debug!(
            requests = batch.len(),
            capacity = batch.total_batch_size,
            "batch sealed"
        );
        if let Err(mpsc::error::SendError(mut batch)) = self.sink.send(batch) {
            tracing::warn!(requests = batch.len(), "runner sink closed, abandoning batch");
            for payload in &mut batch.payloads {
                payload.complete(Err(ScheduleError::ShuttingDown));
            }
        }
    }

    fn complete_rejected(&self, rejected: Vec<Payload>) {
        let now = self.clock.now_ns();
        for mut payload in rejected {
            let waited_ms = now.saturating_sub(payload.stats.queue_start_ns) / NANOS_PER_MS;
            self.metrics.record_rejected();
            tracing::debug!(
                request = payload.request.id,
                waited_ms,
                "request deadline exceeded"
            );
            payload.complete(Err(ScheduleError::DeadlineExceeded { waited_ms }));
        }
    }

    /// Drain at shutdown: rejected payloads complete with their deadline
    /// error, everything still queued completes with a shutdown error.
    pub(crate) async fn drain(&mut self) {
        let mut queue = self.queue.lock().await;
        let rejected: Vec<Payload> = queue
            .release_rejected_payloads()
            .into_iter()
            .flatten()
            .collect();

        let mut abandoned = 0usize;
        while let Ok(mut payload) = queue.dequeue() {
            abandoned += 1;
            self.metrics.record_abandoned();
            payload.complete(Err(ScheduleError::ShuttingDown));
        }
        drop(queue);

        self.complete_rejected(rejected);
        tracing::info!(abandoned, "batcher: drained");
    }
}

/// Spawn the batcher loop. Returns a handle for shutdown.
pub fn spawn_batcher(
    builder: BatchBuilder,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        batch_loop(builder, notify, shutdown).await;
    })
}

async fn batch_loop(
    mut builder: BatchBuilder,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
) {
    tracing::info!("batcher: started");
    loop {
        let wake_at_ns = builder.tick().await;
        let wait = wake_at_ns
            .map(|at| Duration::from_nanos(at.saturating_sub(builder.now_ns())));
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                tracing::info!("batcher: shutdown signal received");
                break;
            }
            () = notify.notified() => {}
            () = wait_until(wait) => {}
        }
    }
    builder.drain().await;
}

/// Sleep until the given delay elapses, or forever when there is nothing
/// scheduled to recheck.
async fn wait_until(wait: Option<Duration>) {
    match wait {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
#[path = "batcher_tests.rs"]
mod tests;
