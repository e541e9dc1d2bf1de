//! Policy-driven cleanup.
//!
//! [`CleanupService`] resolves each repository's cleanup policies into
//! concrete item lists and hands them to the [`BulkDeletionCoordinator`],
//! which removes the metadata and soft deletes the blobs nothing references
//! any more. Physical removal is left to the reclaimer.

mod coordinator;
mod policy;

pub use coordinator::{BulkDeletionCoordinator, DEFAULT_BATCH_SIZE};
pub use policy::{CleanupService, PolicyRun};

/// Running counters of a bulk deletion. Counters only grow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionProgress {
    /// Items of committed batches
    pub count: u64,
    pub components_deleted: u64,
    pub assets_deleted: u64,
    pub blobs_soft_deleted: u64,
    /// Still referenced, or the reference check was inconclusive
    pub blobs_retained: u64,
    /// Asset pointed at a blob the store does not have
    pub blobs_missing: u64,
    pub blobs_failed: u64,
    pub batches: u64,
    pub failed_batches: u64,
    pub cancelled: bool,
}

impl DeletionProgress {
    /// Add the counters of a later run.
    pub fn merge(&mut self, other: &DeletionProgress) {
        self.count += other.count;
        self.components_deleted += other.components_deleted;
        self.assets_deleted += other.assets_deleted;
        self.blobs_soft_deleted += other.blobs_soft_deleted;
        self.blobs_retained += other.blobs_retained;
        self.blobs_missing += other.blobs_missing;
        self.blobs_failed += other.blobs_failed;
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
        self.cancelled |= other.cancelled;
    }

    pub fn is_failed(&self) -> bool {
        self.failed_batches > 0 || self.blobs_failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_accumulates() {
        let mut total = DeletionProgress {
            count: 500,
            batches: 1,
            cancelled: true,
            ..Default::default()
        };
        total.merge(&DeletionProgress {
            count: 700,
            batches: 2,
            blobs_failed: 1,
            ..Default::default()
        });

        assert_eq!(total.count, 1200);
        assert_eq!(total.batches, 3);
        assert!(total.cancelled);
        assert!(total.is_failed());
    }
}
