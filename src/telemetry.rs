//! Telemetry for the scheduling core.
//!
//! Atomic counters snapshotable for export, plus tracing-subscriber
//! initialization. Structured events are emitted at the call sites; this
//! module only holds the value-oriented store.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Snapshot of scheduler metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub rejected: u64,
    pub batches_sealed: u64,
    pub payloads_batched: u64,
    pub abandoned: u64,
    pub queue_depth: u64,
}

/// Thread-safe counters for one scheduler instance.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    batches_sealed: AtomicU64,
    payloads_batched: AtomicU64,
    abandoned: AtomicU64,
    queue_depth: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self, queue_depth: usize) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.store(queue_depth as u64, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_sealed(&self, requests: usize, queue_depth: usize) {
        self.batches_sealed.fetch_add(1, Ordering::Relaxed);
        self.payloads_batched.fetch_add(requests as u64, Ordering::Relaxed);
        self.queue_depth.store(queue_depth as u64, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            batches_sealed: self.batches_sealed.load(Ordering::Relaxed),
            payloads_batched: self.payloads_batched.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logging (default for production).
    #[default]
    Json,
    /// Human-readable pretty printing (for development).
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Log level filter (e.g. "info", "sched_core=debug").
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

/// Errors that can occur during logging initialization.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("Subscriber already initialized")]
    AlreadyInitialized,
}

/// Initialize the tracing subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| LogError::InvalidFilter(e.to_string()))?;
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json())
            .try_init()
            .map_err(|_| LogError::AlreadyInitialized),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty())
            .try_init()
            .map_err(|_| LogError::AlreadyInitialized),
    }
}
