//! Scheduler configuration loading from environment variables.
//!
//! All configuration values are loaded from `SCHED_*` environment variables
//! with sensible defaults. Invalid values fall back to defaults without
//! crashing. Per-level policy overrides and the shape-enforcement map are
//! programmatic-only.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `SCHED_PRIORITY_LEVELS` | 0 | Priority levels (0 = single queue) |
//! | `SCHED_MAX_QUEUE_SIZE` | 0 | Per-level queue cap (0 = unbounded) |
//! | `SCHED_DEFAULT_TIMEOUT_MS` | 0 | Default per-request deadline (0 = none) |
//! | `SCHED_ALLOW_TIMEOUT_OVERRIDE` | false | Honor smaller per-request timeouts |
//! | `SCHED_TIMEOUT_ACTION` | reject | `reject` or `delay` |
//! | `SCHED_MAX_BATCH_SIZE` | 8 | Batch capacity cap (0 = unbounded) |
//! | `SCHED_PREFERRED_BATCH_SIZE` | 0 | Size at which the delay window stops holding |
//! | `SCHED_MAX_QUEUE_DELAY_US` | 0 | Max wait of the oldest claimed payload |

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What to do with a payload whose deadline expired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutAction {
    /// Keep the payload eligible for batching, exempt from further timeouts.
    Delay,
    /// Move the payload to the rejected queue for harvest.
    #[default]
    Reject,
}

/// Timeout and capacity policy for one priority level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// Maximum live + delayed payloads (0 = unbounded).
    pub max_queue_size: usize,
    /// Default per-request deadline in milliseconds (0 = no deadline).
    pub default_timeout_ms: u64,
    /// Honor a request's own timeout when nonzero and smaller than the default.
    pub allow_timeout_override: bool,
    pub timeout_action: TimeoutAction,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_queue_size: 0,
            default_timeout_ms: 0,
            allow_timeout_override: false,
            timeout_action: TimeoutAction::Reject,
        }
    }
}

/// Configuration for one scheduler instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of priority levels; 0 means a single unprioritized queue.
    pub priority_levels: u32,
    /// Policy applied to any level without an override.
    pub default_policy: QueuePolicy,
    /// Per-level policy overrides, keyed by level.
    pub policy_overrides: HashMap<u32, QueuePolicy>,
    /// Hard cap on summed request batch sizes per sealed batch (0 = unbounded).
    pub max_batch_size: usize,
    /// Batch size at which the delay window stops holding a batch open.
    pub preferred_batch_size: usize,
    /// How long the oldest claimed payload may wait before sealing, in ns.
    pub max_queue_delay_ns: u64,
    /// Inputs whose shapes must match across a batch: name -> is-shape-tensor.
    /// Shape tensors additionally match on tensor contents.
    pub enforce_equal_shape_tensors: HashMap<String, bool>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            priority_levels: 0,
            default_policy: QueuePolicy::default(),
            policy_overrides: HashMap::new(),
            max_batch_size: 8,
            preferred_batch_size: 0,
            max_queue_delay_ns: 0,
            enforce_equal_shape_tensors: HashMap::new(),
        }
    }
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub priority_levels: u32,
    pub max_queue_size: usize,
    pub default_timeout_ms: u64,
    pub allow_timeout_override: bool,
    pub timeout_action: TimeoutAction,
    pub max_batch_size: usize,
    pub preferred_batch_size: usize,
    pub max_queue_delay_us: u64,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a boolean env var ("1"/"true"/"yes", case-insensitive).
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

/// Parse the timeout action ("reject" or "delay").
fn parse_timeout_action(key: &str, default: TimeoutAction) -> TimeoutAction {
    match std::env::var(key) {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "delay" => TimeoutAction::Delay,
            "reject" => TimeoutAction::Reject,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Load the default-level queue policy from environment.
fn load_queue_policy() -> QueuePolicy {
    QueuePolicy {
        max_queue_size: parse_usize("SCHED_MAX_QUEUE_SIZE", 0),
        default_timeout_ms: parse_u64("SCHED_DEFAULT_TIMEOUT_MS", 0),
        allow_timeout_override: parse_bool("SCHED_ALLOW_TIMEOUT_OVERRIDE", false),
        timeout_action: parse_timeout_action("SCHED_TIMEOUT_ACTION", TimeoutAction::Reject),
    }
}

/// Load all scheduler configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> SchedulerConfig {
    let priority_levels = parse_u32("SCHED_PRIORITY_LEVELS", 0);
    let max_batch_size = parse_usize("SCHED_MAX_BATCH_SIZE", 8);
    let preferred_batch_size = parse_usize("SCHED_PREFERRED_BATCH_SIZE", 0);
    // clamp: preferred <= max when capped
    let preferred_batch_size = if max_batch_size != 0 {
        preferred_batch_size.min(max_batch_size)
    } else {
        preferred_batch_size
    };
    let max_queue_delay_us = parse_u64("SCHED_MAX_QUEUE_DELAY_US", 0);

    SchedulerConfig {
        priority_levels,
        default_policy: load_queue_policy(),
        policy_overrides: HashMap::new(),
        max_batch_size,
        preferred_batch_size,
        max_queue_delay_ns: max_queue_delay_us * 1_000,
        enforce_equal_shape_tensors: HashMap::new(),
    }
}

impl SchedulerConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            priority_levels: self.priority_levels,
            max_queue_size: self.default_policy.max_queue_size,
            default_timeout_ms: self.default_policy.default_timeout_ms,
            allow_timeout_override: self.default_policy.allow_timeout_override,
            timeout_action: self.default_policy.timeout_action,
            max_batch_size: self.max_batch_size,
            preferred_batch_size: self.preferred_batch_size,
            max_queue_delay_us: self.max_queue_delay_ns / 1_000,
        }
    }
}
