//! Reclamation metrics tracking
//!
//! Thread-safe counters shared by every reclaimer and the cleanup runner.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Thread-safe metrics for reclamation and cleanup work
#[derive(Debug, Clone, Default)]
pub struct ReclaimMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    passes_started: AtomicU64,
    passes_completed: AtomicU64,
    passes_failed: AtomicU64,
    records_examined: AtomicU64,
    blobs_hard_deleted: AtomicU64,
    content_missing: AtomicU64,
    blobs_retained: AtomicU64,
    hard_delete_failures: AtomicU64,
    blobs_soft_deleted: AtomicU64,
    items_deleted: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl ReclaimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pass_start(&self) {
        self.inner.passes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass_complete(&self, duration: Duration) {
        self.inner.passes_completed.fetch_add(1, Ordering::Relaxed);
        self.inner
            .total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_pass_failure(&self) {
        self.inner.passes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_examined(&self, n: u64) {
        self.inner.records_examined.fetch_add(n, Ordering::Relaxed);
    }

    /// A ledger entry cleared after a hard delete. `content_present` is false
    /// when the bytes were already gone.
    pub fn record_hard_delete(&self, content_present: bool) {
        if content_present {
            self.inner.blobs_hard_deleted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.content_missing.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retained(&self) {
        self.inner.blobs_retained.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hard_delete_failure(&self) {
        self.inner
            .hard_delete_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bulk_deletion(&self, items: u64, blobs_soft_deleted: u64) {
        self.inner.items_deleted.fetch_add(items, Ordering::Relaxed);
        self.inner
            .blobs_soft_deleted
            .fetch_add(blobs_soft_deleted, Ordering::Relaxed);
    }

    pub fn passes_started(&self) -> u64 {
        self.inner.passes_started.load(Ordering::Relaxed)
    }

    pub fn passes_completed(&self) -> u64 {
        self.inner.passes_completed.load(Ordering::Relaxed)
    }

    pub fn passes_failed(&self) -> u64 {
        self.inner.passes_failed.load(Ordering::Relaxed)
    }

    pub fn records_examined(&self) -> u64 {
        self.inner.records_examined.load(Ordering::Relaxed)
    }

    pub fn blobs_hard_deleted(&self) -> u64 {
        self.inner.blobs_hard_deleted.load(Ordering::Relaxed)
    }

    pub fn content_missing(&self) -> u64 {
        self.inner.content_missing.load(Ordering::Relaxed)
    }

    pub fn blobs_retained(&self) -> u64 {
        self.inner.blobs_retained.load(Ordering::Relaxed)
    }

    pub fn hard_delete_failures(&self) -> u64 {
        self.inner.hard_delete_failures.load(Ordering::Relaxed)
    }

    pub fn blobs_soft_deleted(&self) -> u64 {
        self.inner.blobs_soft_deleted.load(Ordering::Relaxed)
    }

    pub fn items_deleted(&self) -> u64 {
        self.inner.items_deleted.load(Ordering::Relaxed)
    }

    /// Calculate the average pass duration
    pub fn avg_duration_ms(&self) -> f64 {
        let total_ms = self.inner.total_duration_ms.load(Ordering::Relaxed) as f64;
        let passes = self.passes_completed() as f64;

        if passes > 0.0 { total_ms / passes } else { 0.0 }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            passes_started: self.passes_started(),
            passes_completed: self.passes_completed(),
            passes_failed: self.passes_failed(),
            records_examined: self.records_examined(),
            blobs_hard_deleted: self.blobs_hard_deleted(),
            content_missing: self.content_missing(),
            blobs_retained: self.blobs_retained(),
            hard_delete_failures: self.hard_delete_failures(),
            blobs_soft_deleted: self.blobs_soft_deleted(),
            items_deleted: self.items_deleted(),
            avg_duration_ms: self.avg_duration_ms(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub passes_started: u64,
    pub passes_completed: u64,
    pub passes_failed: u64,
    pub records_examined: u64,
    pub blobs_hard_deleted: u64,
    pub content_missing: u64,
    pub blobs_retained: u64,
    pub hard_delete_failures: u64,
    pub blobs_soft_deleted: u64,
    pub items_deleted: u64,
    pub avg_duration_ms: f64,
}

impl MetricsSummary {
    pub fn log(&self) {
        log::info!("=== Reclamation Metrics Summary ===");
        log::info!(
            "Passes: {} started, {} completed, {} failed",
            self.passes_started,
            self.passes_completed,
            self.passes_failed
        );
        log::info!(
            "Ledger: {} examined, {} hard deleted, {} already missing, {} retained, {} failed",
            self.records_examined,
            self.blobs_hard_deleted,
            self.content_missing,
            self.blobs_retained,
            self.hard_delete_failures
        );
        log::info!(
            "Cleanup: {} items deleted, {} blobs soft deleted",
            self.items_deleted,
            self.blobs_soft_deleted
        );
        log::info!("Average pass duration: {:.2}ms", self.avg_duration_ms);
    }
}
