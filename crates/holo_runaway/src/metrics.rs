//! In-process counters for the runaway pipeline.
//!
//! Hot-path sends never block; these counters make the dropped ones visible.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated counters for detection, flushing and watch synchronization.
#[derive(Debug, Default)]
pub struct RunawayMetrics {
    /// Records dropped because the record channel was full.
    records_dropped: AtomicU64,
    /// Quarantine entries dropped because the insertion channel was full.
    quarantines_dropped: AtomicU64,
    /// Stale watch entries dropped because the cleanup channel was full.
    stale_dropped: AtomicU64,
    /// Rows written to `mysql.holo_runaway_queries`.
    records_flushed: AtomicU64,
    /// Flush batches that failed and were discarded.
    flush_failures: AtomicU64,
    /// Watch rows applied to the local watch list by the sync loop.
    watches_synced: AtomicU64,
    /// Watches moved to the done table.
    stale_cleanups: AtomicU64,
    /// Watches whose move to the done table gave up after all attempts.
    stale_cleanup_failures: AtomicU64,
    /// Rows deleted by record garbage collection.
    records_garbage_collected: AtomicU64,
}

/// Point-in-time copy of [`RunawayMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunawayMetricsSnapshot {
    pub records_dropped: u64,
    pub quarantines_dropped: u64,
    pub stale_dropped: u64,
    pub records_flushed: u64,
    pub flush_failures: u64,
    pub watches_synced: u64,
    pub stale_cleanups: u64,
    pub stale_cleanup_failures: u64,
    pub records_garbage_collected: u64,
}

impl RunawayMetrics {
    pub fn record_record_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quarantine_dropped(&self) {
        self.quarantines_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_dropped(&self) {
        self.stale_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, rows: u64) {
        self.records_flushed.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_watch_synced(&self) {
        self.watches_synced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_cleanup(&self) {
        self.stale_cleanups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_cleanup_failure(&self) {
        self.stale_cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_garbage_collected(&self, rows: u64) {
        self.records_garbage_collected
            .fetch_add(rows, Ordering::Relaxed);
    }

    /// Captures a point-in-time copy of all counters.
    pub fn snapshot(&self) -> RunawayMetricsSnapshot {
        RunawayMetricsSnapshot {
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            quarantines_dropped: self.quarantines_dropped.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            records_flushed: self.records_flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            watches_synced: self.watches_synced.load(Ordering::Relaxed),
            stale_cleanups: self.stale_cleanups.load(Ordering::Relaxed),
            stale_cleanup_failures: self.stale_cleanup_failures.load(Ordering::Relaxed),
            records_garbage_collected: self.records_garbage_collected.load(Ordering::Relaxed),
        }
    }
}
