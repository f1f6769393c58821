//! In-flight request representation.
//!
//! A [`Payload`] is owned exclusively by the scheduler from enqueue until it
//! is dequeued into a batch, rejected, or abandoned at shutdown.

use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// Sender half of a request's completion channel. The scheduler reports
/// terminal queue status here (rejection, shutdown); once a payload is
/// handed to the runner, the runner owns completion.
pub type CompletionTx = tokio::sync::oneshot::Sender<Result<(), ScheduleError>>;
/// Receiver half for awaiting a request's terminal queue status.
pub type CompletionRx = tokio::sync::oneshot::Receiver<Result<(), ScheduleError>>;

/// One declared input tensor of an inference request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInput {
    /// Input tensor name.
    pub name: String,
    /// Declared dimensions.
    pub dims: Vec<i64>,
}

impl RequestInput {
    pub fn new(name: impl Into<String>, dims: Vec<i64>) -> Self {
        Self { name: name.into(), dims }
    }
}

/// Opaque request handle owning the declared inputs and scheduling metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub id: u64,
    pub inputs: Vec<RequestInput>,
    /// Per-request timeout override in milliseconds (0 = unset).
    pub timeout_override_ms: u64,
    /// Capacity this request contributes to a batch.
    pub batch_size: usize,
}

impl InferenceRequest {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            inputs: Vec::new(),
            timeout_override_ms: 0,
            batch_size: 1,
        }
    }
}

/// Observability handle for one payload's trip through the queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadStats {
    /// Monotonic timestamp stamped when the payload entered its queue.
    pub queue_start_ns: u64,
}

/// One request in flight inside the scheduler.
pub struct Payload {
    pub request: InferenceRequest,
    pub stats: PayloadStats,
    /// Channel for reporting terminal queue status back to the caller.
    pub completion: Option<CompletionTx>,
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("id", &self.request.id)
            .field("batch_size", &self.request.batch_size)
            .field("queue_start_ns", &self.stats.queue_start_ns)
            .finish()
    }
}

impl Payload {
    pub fn new(request: InferenceRequest) -> Self {
        Self {
            request,
            stats: PayloadStats::default(),
            completion: None,
        }
    }

    pub fn with_completion(mut self, tx: CompletionTx) -> Self {
        self.completion = Some(tx);
        self
    }

    /// Deliver a terminal status. Silently dropped when the caller went away.
    pub fn complete(&mut self, result: Result<(), ScheduleError>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}
