//! Diagnostics
//!
//! Running counters owned by the engine and the read-only snapshot handed
//! out by `Observer::stats`.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::filter::FilterReason;
use crate::recovery::EngineMode;
use crate::source::SourceKind;

/// Upper bounds (inclusive, ms) of the batch timing buckets; one overflow
/// bucket follows.
pub const BATCH_BUCKETS_MS: [u64; 7] = [1, 2, 4, 8, 16, 32, 64];

/// Fixed-bucket timing histogram
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimingHistogram {
    pub bounds_ms: Vec<u64>,
    /// One count per bound plus the overflow bucket
    pub counts: Vec<u64>,
    pub samples: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl Default for TimingHistogram {
    fn default() -> Self {
        Self {
            bounds_ms: BATCH_BUCKETS_MS.to_vec(),
            counts: vec![0; BATCH_BUCKETS_MS.len() + 1],
            samples: 0,
            total_ms: 0,
            max_ms: 0,
        }
    }
}

impl TimingHistogram {
    pub fn record(&mut self, ms: u64) {
        let bucket = self
            .bounds_ms
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(self.bounds_ms.len());
        self.counts[bucket] += 1;
        self.samples += 1;
        self.total_ms = self.total_ms.saturating_add(ms);
        self.max_ms = self.max_ms.max(ms);
    }

    pub fn mean_ms(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.samples as f64
        }
    }
}

/// Engine-owned counters
#[derive(Debug, Default, Clone)]
pub(crate) struct Counters {
    pub received: BTreeMap<SourceKind, u64>,
    pub filtered: BTreeMap<FilterReason, u64>,
    pub enqueued: u64,
    pub processed_targets: u64,
    pub callbacks_run: u64,
    pub callback_errors: u64,
    pub retries: u64,
    pub abandoned: u64,
    pub lazy_parked: u64,
    pub lazy_released: u64,
    pub yields: u64,
    pub batches: TimingHistogram,
}

impl Counters {
    pub fn received(&mut self, source: SourceKind) {
        *self.received.entry(source).or_default() += 1;
    }

    pub fn filtered(&mut self, reason: FilterReason) {
        *self.filtered.entry(reason).or_default() += 1;
    }
}

/// Diagnostics snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObserverStats {
    pub mode: EngineMode,
    pub destroyed: bool,
    pub queue_length: usize,
    pub received: BTreeMap<&'static str, u64>,
    pub filtered: BTreeMap<&'static str, u64>,
    pub enqueued: u64,
    pub dropped: u64,
    pub overflows: u64,
    pub processed_targets: u64,
    pub callbacks_run: u64,
    pub callback_errors: u64,
    pub retries: u64,
    pub abandoned_callbacks: u64,
    pub systemic_errors: u64,
    pub mode_transitions: u64,
    pub recovery_attempts: u64,
    pub dedup_size: usize,
    pub dedup_evictions: u64,
    pub subscriptions: usize,
    pub connected_sources: usize,
    pub nested_scopes: usize,
    pub pending_tasks: usize,
    /// Callbacks parked in deferred lanes or waiting for a retry
    pub pending_callbacks: usize,
    pub parked_lazy: usize,
    pub lazy_parked: u64,
    pub lazy_released: u64,
    pub yields: u64,
    pub batch_timings: TimingHistogram,
}

impl ObserverStats {
    pub(crate) fn received_map(counters: &Counters) -> BTreeMap<&'static str, u64> {
        SourceKind::ALL
            .iter()
            .map(|&kind| (kind.as_str(), counters.received.get(&kind).copied().unwrap_or(0)))
            .collect()
    }

    pub(crate) fn filtered_map(counters: &Counters) -> BTreeMap<&'static str, u64> {
        FilterReason::ALL
            .iter()
            .map(|&reason| {
                (reason.as_str(), counters.filtered.get(&reason).copied().unwrap_or(0))
            })
            .collect()
    }

    /// Total events rejected by the filter
    pub fn filtered_total(&self) -> u64 {
        self.filtered.values().sum()
    }

    pub fn received_from(&self, source: SourceKind) -> u64 {
        self.received.get(source.as_str()).copied().unwrap_or(0)
    }

    pub fn filtered_for(&self, reason: FilterReason) -> u64 {
        self.filtered.get(reason.as_str()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets() {
        let mut h = TimingHistogram::default();
        for ms in [0, 1, 3, 16, 17, 500] {
            h.record(ms);
        }
        assert_eq!(h.counts, vec![2, 0, 1, 0, 1, 1, 0, 1]);
        assert_eq!(h.samples, 6);
        assert_eq!(h.max_ms, 500);
        assert_eq!(h.total_ms, 537);
        assert!((h.mean_ms() - 89.5).abs() < 1e-9);
    }

    #[test]
    fn test_counter_maps_list_every_key() {
        let mut counters = Counters::default();
        counters.received(SourceKind::Backup);
        counters.filtered(FilterReason::Invisible);
        counters.filtered(FilterReason::Invisible);

        let received = ObserverStats::received_map(&counters);
        assert_eq!(received.len(), SourceKind::ALL.len());
        assert_eq!(received["backup"], 1);
        assert_eq!(received["primary"], 0);

        let filtered = ObserverStats::filtered_map(&counters);
        assert_eq!(filtered["invisible"], 2);
    }
}
