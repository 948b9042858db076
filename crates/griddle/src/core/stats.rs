use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crate::communication::FlushReason;

/// Lock-free counters shared by the batcher and the postprocessor.
#[derive(Debug, Default)]
pub(crate) struct BatchStats {
    items_submitted: AtomicU64,
    items_completed: AtomicU64,
    size_flushes: AtomicU64,
    timeout_flushes: AtomicU64,
    retry_flushes: AtomicU64,
    failed_batches: AtomicU64,
    largest_batch: AtomicUsize,
}

impl BatchStats {
    pub(crate) fn record_submit(&self) {
        self.items_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, reason: FlushReason, len: usize) {
        let counter = match reason {
            FlushReason::Size => &self.size_flushes,
            FlushReason::Timeout => &self.timeout_flushes,
            FlushReason::Retry => &self.retry_flushes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.largest_batch.fetch_max(len, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, items: usize) {
        self.items_completed.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_batch(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        let size_flushes = self.size_flushes.load(Ordering::Relaxed);
        let timeout_flushes = self.timeout_flushes.load(Ordering::Relaxed);
        let retry_flushes = self.retry_flushes.load(Ordering::Relaxed);
        StatsSnapshot {
            items_submitted: self.items_submitted.load(Ordering::Relaxed),
            items_completed: self.items_completed.load(Ordering::Relaxed),
            batches_flushed: size_flushes + timeout_flushes + retry_flushes,
            size_flushes,
            timeout_flushes,
            retry_flushes,
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            largest_batch: self.largest_batch.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a service's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Items accepted into the buffer
    pub items_submitted: u64,
    /// Items whose handle received a value
    pub items_completed: u64,
    /// Batches sealed and queued, for any reason
    pub batches_flushed: u64,
    pub size_flushes: u64,
    pub timeout_flushes: u64,
    /// Flushes that went through after backpressure deferred them
    pub retry_flushes: u64,
    /// Batches failed by the processor
    pub failed_batches: u64,
    pub largest_batch: usize,
}
