use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the orchestration loop.
///
/// Passed around as `Arc<WorkerMetrics>`; there is no global instance.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    messages_processed: AtomicU64,
    messages_failed: AtomicU64,
    messages_skipped_busy: AtomicU64,
    messages_unrouted: AtomicU64,
    messages_filtered: AtomicU64,
    records_produced: AtomicU64,
    duplicates_suppressed: AtomicU64,
    errors_produced: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub messages_skipped_busy: u64,
    pub messages_unrouted: u64,
    pub messages_filtered: u64,
    pub records_produced: u64,
    pub duplicates_suppressed: u64,
    pub errors_produced: u64,
    pub retries: u64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message fully handled and committed.
    pub fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Delivery left for redelivery because its key was already active.
    pub fn record_skipped_busy(&self) {
        self.messages_skipped_busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unrouted(&self) {
        self.messages_unrouted.fetch_add(1, Ordering::Relaxed);
    }

    /// Message addressed to a different integration.
    pub fn record_filtered(&self) {
        self.messages_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_produced(&self) {
        self.records_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error_produced(&self) {
        self.errors_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_skipped_busy: self.messages_skipped_busy.load(Ordering::Relaxed),
            messages_unrouted: self.messages_unrouted.load(Ordering::Relaxed),
            messages_filtered: self.messages_filtered.load(Ordering::Relaxed),
            records_produced: self.records_produced.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            errors_produced: self.errors_produced.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}
