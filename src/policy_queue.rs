//! Per-level FIFO with timeout policy.
//!
//! Each priority level owns one [`PolicyQueue`]: a live FIFO whose entries
//! carry absolute deadlines, a delayed sub-queue holding payloads that
//! expired under [`TimeoutAction::Delay`] (still eligible for batching, no
//! longer subject to timeout), and a rejected sub-queue awaiting harvest.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::clock::{Clock, NANOS_PER_MS};
use crate::config::{QueuePolicy, TimeoutAction};
use crate::error::ScheduleError;
use crate::payload::Payload;

pub struct PolicyQueue {
    policy: QueuePolicy,
    clock: Arc<dyn Clock>,
    /// Payloads awaiting batching, still subject to timeout.
    queue: VecDeque<Payload>,
    /// Absolute deadline per live entry (0 = never expires), index-parallel
    /// with `queue`.
    timeouts: VecDeque<u64>,
    delayed: VecDeque<Payload>,
    rejected: VecDeque<Payload>,
}

impl PolicyQueue {
    pub fn new(policy: QueuePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            queue: VecDeque::new(),
            timeouts: VecDeque::new(),
            delayed: VecDeque::new(),
            rejected: VecDeque::new(),
        }
    }

    /// Append a payload, stamping its queue-start time and deadline.
    ///
    /// The request's own timeout wins only when overrides are allowed and it
    /// is nonzero and smaller than the policy default. An effective timeout
    /// of zero records a zero deadline, which never expires.
    pub fn enqueue(&mut self, mut payload: Payload) -> Result<(), ScheduleError> {
        if self.policy.max_queue_size != 0 && self.size() >= self.policy.max_queue_size {
            return Err(ScheduleError::QueueFull {
                current: self.size(),
                max: self.policy.max_queue_size,
            });
        }

        let now = self.clock.now_ns();
        payload.stats.queue_start_ns = now;

        let mut timeout_ms = self.policy.default_timeout_ms;
        if self.policy.allow_timeout_override {
            let override_ms = payload.request.timeout_override_ms;
            if override_ms != 0 && override_ms < timeout_ms {
                timeout_ms = override_ms;
            }
        }
        let deadline_ns = if timeout_ms != 0 { now + timeout_ms * NANOS_PER_MS } else { 0 };

        self.queue.push_back(payload);
        self.timeouts.push_back(deadline_ns);
        debug_assert_eq!(self.queue.len(), self.timeouts.len());
        Ok(())
    }

    /// Remove and return the front payload: live queue first, then delayed.
    pub fn dequeue(&mut self) -> Option<Payload> {
        if let Some(payload) = self.queue.pop_front() {
            self.timeouts.pop_front();
            Some(payload)
        } else {
            self.delayed.pop_front()
        }
    }

    /// Advance through the live queue from `idx`, evicting every payload
    /// whose nonzero deadline lies in the past. Evictions route to the
    /// delayed or rejected sub-queue according to the policy action;
    /// rejections increment the two out-parameters. Later live entries shift
    /// down by one per eviction, so callers must re-read [`Self::at`].
    ///
    /// Returns whether `idx` still identifies a claimable payload: an
    /// unexpired live entry, or a delayed entry at `idx - live_len`. Delayed
    /// entries are not re-examined; their contract is "expired but retained
    /// for batching".
    pub fn apply_policy(
        &mut self,
        idx: usize,
        rejected_count: &mut usize,
        rejected_batch_size: &mut usize,
    ) -> bool {
        let now = self.clock.now_ns();
        while idx < self.queue.len() {
            let deadline_ns = self.timeouts[idx];
            if deadline_ns == 0 || deadline_ns >= now {
                return true;
            }
            let _ = self.timeouts.remove(idx);
            if let Some(payload) = self.queue.remove(idx) {
                match self.policy.timeout_action {
                    TimeoutAction::Delay => self.delayed.push_back(payload),
                    TimeoutAction::Reject => {
                        *rejected_count += 1;
                        *rejected_batch_size += payload.request.batch_size;
                        self.rejected.push_back(payload);
                    }
                }
            }
        }
        idx - self.queue.len() < self.delayed.len()
    }

    /// Payload at `idx` over the concatenation of live and delayed entries.
    pub fn at(&self, idx: usize) -> Option<&Payload> {
        if idx < self.queue.len() {
            self.queue.get(idx)
        } else {
            self.delayed.get(idx - self.queue.len())
        }
    }

    /// Deadline at `idx`; zero for delayed entries.
    pub fn timeout_at(&self, idx: usize) -> u64 {
        if idx < self.queue.len() {
            self.timeouts[idx]
        } else {
            0
        }
    }

    /// Atomically take the rejected sub-queue.
    pub fn release_rejected_queue(&mut self) -> VecDeque<Payload> {
        std::mem::take(&mut self.rejected)
    }

    /// Live + delayed payload count.
    pub fn size(&self) -> usize {
        self.queue.len() + self.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Length of the live queue alone.
    pub fn live_len(&self) -> usize {
        self.queue.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    pub fn rejected_len(&self) -> usize {
        self.rejected.len()
    }
}

#[cfg(test)]
#[path = "policy_queue_tests.rs"]
mod tests;
