//! Priority-ordered policy queues with a pending-batch cursor.
//!
//! Lower-numbered levels are served first. The [`Cursor`] bookmarks the
//! batch currently being formed: a stable prefix of claimed payloads across
//! the level walk, together with the earliest deadline and oldest enqueue
//! time among them. Synchronization lives one layer up, in the batcher.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{QueuePolicy, SchedulerConfig};
use crate::error::ScheduleError;
use crate::payload::Payload;
use crate::policy_queue::PolicyQueue;

/// Bookmark into the queue identifying the forming pending batch.
#[derive(Debug, Clone)]
struct Cursor {
    /// Index of the level currently being scanned.
    curr_level: usize,
    /// Offset within that level over live-then-delayed entries.
    queue_idx: usize,
    pending_batch_count: usize,
    /// Smallest nonzero deadline among claimed payloads (0 = none).
    pending_batch_closest_timeout_ns: u64,
    /// Oldest queue-start among claimed payloads (0 = none claimed).
    pending_batch_oldest_enqueue_time_ns: u64,
    valid: bool,
}

impl Cursor {
    fn start() -> Self {
        Self {
            curr_level: 0,
            queue_idx: 0,
            pending_batch_count: 0,
            pending_batch_closest_timeout_ns: 0,
            pending_batch_oldest_enqueue_time_ns: 0,
            valid: true,
        }
    }
}

pub struct PriorityQueue {
    priority_levels: u32,
    /// One policy queue per level, ascending by level.
    queues: Vec<PolicyQueue>,
    /// Total live + delayed payloads across all levels.
    size: usize,
    cursor: Cursor,
    clock: Arc<dyn Clock>,
}

impl PriorityQueue {
    /// Build the per-level queues: a single level 0 when `priority_levels`
    /// is zero, else levels `1..=priority_levels`, each taking its override
    /// policy or the default.
    pub fn new(
        default_policy: QueuePolicy,
        priority_levels: u32,
        policy_overrides: &HashMap<u32, QueuePolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut queues = Vec::new();
        if priority_levels == 0 {
            queues.push(PolicyQueue::new(default_policy, clock.clone()));
        } else {
            for level in 1..=priority_levels {
                let policy = policy_overrides
                    .get(&level)
                    .cloned()
                    .unwrap_or_else(|| default_policy.clone());
                queues.push(PolicyQueue::new(policy, clock.clone()));
            }
        }
        Self {
            priority_levels,
            queues,
            size: 0,
            cursor: Cursor::start(),
            clock,
        }
    }

    pub fn from_config(config: &SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.default_policy.clone(),
            config.priority_levels,
            &config.policy_overrides,
            clock,
        )
    }

    /// Map a requested level onto a configured queue index. Out-of-range
    /// levels clamp into the configured range.
    fn index_for(&self, level: u32) -> usize {
        if self.priority_levels == 0 {
            0
        } else {
            (level.clamp(1, self.priority_levels) - 1) as usize
        }
    }

    /// Level number of the queue at `idx`.
    pub fn level_of(&self, idx: usize) -> u32 {
        if self.priority_levels == 0 {
            0
        } else {
            idx as u32 + 1
        }
    }

    /// Hand a payload to the policy queue for `level`.
    ///
    /// The cursor survives only inserts that land behind every claimed
    /// position: a strictly lower-priority level, or the same level while
    /// the cursor is still inside the live region (a live-tail append then
    /// sorts after the whole claimed prefix).
    pub fn enqueue(&mut self, level: u32, payload: Payload) -> Result<(), ScheduleError> {
        let idx = self.index_for(level);
        self.queues[idx].enqueue(payload)?;
        self.size += 1;
        self.cursor.valid = self.cursor.valid
            && (idx > self.cursor.curr_level
                || (idx == self.cursor.curr_level
                    && self.cursor.queue_idx < self.queues[idx].live_len()));
        Ok(())
    }

    /// Remove and return the front payload of the lowest-numbered nonempty
    /// level. Invalidates the cursor.
    pub fn dequeue(&mut self) -> Result<Payload, ScheduleError> {
        self.cursor.valid = false;
        for queue in &mut self.queues {
            if let Some(payload) = queue.dequeue() {
                self.size -= 1;
                return Ok(payload);
            }
        }
        Err(ScheduleError::EmptyQueue)
    }

    /// Whether the cached pending batch can be reused: the cursor must
    /// reflect the current queue contents and, when some claimed payload
    /// carries a deadline, that deadline must not have passed.
    pub fn is_cursor_valid(&self) -> bool {
        if !self.cursor.valid {
            return false;
        }
        let closest = self.cursor.pending_batch_closest_timeout_ns;
        closest == 0 || self.clock.now_ns() < closest
    }

    /// Drive the cursor forward across expired payloads and exhausted
    /// levels until it rests on a claimable candidate, or until every
    /// remaining payload is already claimed. Returns the summed batch sizes
    /// of the payloads rejected along the way; `size` drops by the rejected
    /// count.
    pub fn apply_policy_at_cursor(&mut self) -> usize {
        let mut rejected_count = 0;
        let mut rejected_batch_size = 0;
        while self.cursor.curr_level < self.queues.len() {
            let has_candidate = self.queues[self.cursor.curr_level].apply_policy(
                self.cursor.queue_idx,
                &mut rejected_count,
                &mut rejected_batch_size,
            );
            if !has_candidate
                && self.size > self.cursor.pending_batch_count + rejected_count
            {
                self.cursor.curr_level += 1;
                self.cursor.queue_idx = 0;
                continue;
            }
            break;
        }
        // A reset cursor walks levels front to back, so it can only run off
        // the end when every remaining payload is already claimed.
        debug_assert!(
            self.cursor.curr_level < self.queues.len()
                || self.size == self.cursor.pending_batch_count + rejected_count,
            "cursor ran past the last level with unclaimed payloads"
        );
        self.size -= rejected_count;
        rejected_batch_size
    }

    /// Claim the payload under the cursor into the pending batch, folding
    /// its deadline and queue-start time into the batch minima. No-op when
    /// every payload is already claimed.
    pub fn advance_cursor(&mut self) {
        if self.cursor.pending_batch_count >= self.size {
            return;
        }
        let Some(queue) = self.queues.get(self.cursor.curr_level) else {
            return;
        };

        let timeout_ns = queue.timeout_at(self.cursor.queue_idx);
        if timeout_ns != 0 {
            let closest = self.cursor.pending_batch_closest_timeout_ns;
            self.cursor.pending_batch_closest_timeout_ns =
                if closest != 0 { closest.min(timeout_ns) } else { timeout_ns };
        }

        if let Some(payload) = queue.at(self.cursor.queue_idx) {
            let enqueue_ns = payload.stats.queue_start_ns;
            let oldest = self.cursor.pending_batch_oldest_enqueue_time_ns;
            self.cursor.pending_batch_oldest_enqueue_time_ns =
                if oldest != 0 { oldest.min(enqueue_ns) } else { enqueue_ns };
        }

        self.cursor.queue_idx += 1;
        self.cursor.pending_batch_count += 1;
    }

    /// Rewind the cursor to the first level with an empty pending batch.
    pub fn reset_cursor(&mut self) {
        self.cursor = Cursor::start();
    }

    /// Harvest every level's rejected payloads, in level order.
    pub fn release_rejected_payloads(&mut self) -> Vec<VecDeque<Payload>> {
        self.queues
            .iter_mut()
            .map(|queue| queue.release_rejected_queue())
            .collect()
    }

    /// Payload the cursor currently rests on, if any.
    pub fn cursor_candidate(&self) -> Option<&Payload> {
        self.queues
            .get(self.cursor.curr_level)
            .and_then(|queue| queue.at(self.cursor.queue_idx))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn pending_batch_count(&self) -> usize {
        self.cursor.pending_batch_count
    }

    /// Smallest nonzero deadline among claimed payloads (0 = none).
    pub fn closest_timeout_ns(&self) -> u64 {
        self.cursor.pending_batch_closest_timeout_ns
    }

    /// Oldest queue-start among claimed payloads (0 = none claimed).
    pub fn oldest_enqueue_time_ns(&self) -> u64 {
        self.cursor.pending_batch_oldest_enqueue_time_ns
    }

    pub fn level_count(&self) -> usize {
        self.queues.len()
    }

    /// Policy queue at level index `idx`, for observability.
    pub fn level_queue(&self, idx: usize) -> Option<&PolicyQueue> {
        self.queues.get(idx)
    }
}

#[cfg(test)]
#[path = "priority_queue_tests.rs"]
mod tests;
