//! Dispatch Queue
//!
//! Bounded FIFO of filtered change events. When an enqueue would exceed the
//! bound exactly one overflow policy applies, and the result is a pure
//! function of the policy, the buffer and the incoming batch.
//!
//! Under [`OverflowPolicy::Clear`] the dropped count is the old queue length
//! plus any new events cut off at the bound, so it accounts for every event
//! that never reaches the drain.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::event::ChangeEvent;

/// Overflow policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep every Nth event of the combined buffer
    Sample,
    /// Discard the existing buffer, keep the new batch
    Clear,
    /// Drop the oldest entries to make room
    #[default]
    Throttle,
}

/// Result of one enqueue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// New events that made it into the buffer
    pub accepted: usize,
    /// Events discarded by this call (old or new)
    pub dropped: usize,
    /// The overflow policy ran
    pub overflowed: bool,
}

/// Bounded dispatch queue
#[derive(Debug)]
pub struct DispatchQueue {
    buffer: VecDeque<ChangeEvent>,
    max_size: usize,
    policy: OverflowPolicy,
    dropped_total: u64,
    overflows: u64,
}

impl DispatchQueue {
    pub fn new(max_size: usize, policy: OverflowPolicy) -> Self {
        Self {
            buffer: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
            policy,
            dropped_total: 0,
            overflows: 0,
        }
    }

    /// Append events, applying the overflow policy when the bound is hit
    pub fn enqueue(&mut self, events: Vec<ChangeEvent>) -> EnqueueOutcome {
        let incoming = events.len();
        if self.buffer.len() + incoming <= self.max_size {
            self.buffer.extend(events);
            return EnqueueOutcome {
                accepted: incoming,
                dropped: 0,
                overflowed: false,
            };
        }

        let outcome = match self.policy {
            OverflowPolicy::Sample => self.sample(events),
            OverflowPolicy::Clear => self.clear_and_keep(events),
            OverflowPolicy::Throttle => self.throttle(events),
        };

        self.overflows += 1;
        self.dropped_total += outcome.dropped as u64;
        tracing::warn!(
            policy = ?self.policy,
            dropped = outcome.dropped,
            len = self.buffer.len(),
            "dispatch queue overflow"
        );
        outcome
    }

    fn sample(&mut self, events: Vec<ChangeEvent>) -> EnqueueOutcome {
        let old_len = self.buffer.len();
        let total = old_len + events.len();
        let rate = total.div_ceil(self.max_size);

        let combined: Vec<ChangeEvent> = self.buffer.drain(..).chain(events).collect();
        let mut accepted = 0;
        for (index, event) in combined.into_iter().enumerate() {
            if index % rate == 0 {
                if index >= old_len {
                    accepted += 1;
                }
                self.buffer.push_back(event);
            }
        }

        EnqueueOutcome {
            accepted,
            dropped: total - self.buffer.len(),
            overflowed: true,
        }
    }

    fn clear_and_keep(&mut self, events: Vec<ChangeEvent>) -> EnqueueOutcome {
        let old_len = self.buffer.len();
        let incoming = events.len();
        self.buffer.clear();
        self.buffer.extend(events.into_iter().take(self.max_size));

        EnqueueOutcome {
            accepted: self.buffer.len(),
            dropped: old_len + (incoming - self.buffer.len()),
            overflowed: true,
        }
    }

    fn throttle(&mut self, events: Vec<ChangeEvent>) -> EnqueueOutcome {
        let overflow = self.buffer.len() + events.len() - self.max_size;
        let from_old = overflow.min(self.buffer.len());
        self.buffer.drain(..from_old);

        // Batch larger than the whole bound: its oldest entries go too
        let from_new = overflow - from_old;
        let accepted = events.len() - from_new;
        self.buffer.extend(events.into_iter().skip(from_new));

        EnqueueOutcome {
            accepted,
            dropped: overflow,
            overflowed: true,
        }
    }

    /// Remove up to `n` events from the front, in order
    pub fn dequeue_batch(&mut self, n: usize) -> Vec<ChangeEvent> {
        let n = n.min(self.buffer.len());
        self.buffer.drain(..n).collect()
    }

    /// Drop everything; returns how many events were discarded
    pub fn clear(&mut self) -> usize {
        let len = self.buffer.len();
        self.buffer.clear();
        len
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Events dropped by overflow since creation
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    /// Number of enqueues that hit the bound
    pub fn overflow_count(&self) -> u64 {
        self.overflows
    }

    /// Buffered events, front first
    pub fn iter(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.buffer.iter()
    }
}
