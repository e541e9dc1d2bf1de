use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use common::blob::{BlobStoreError, ContentStore};
use common::config::ReclaimConfig;
use common::ledger::{DeletionLedger, DeletionRecord, LedgerCursor};
use tokio_util::sync::CancellationToken;

use super::ReclaimResult;
use crate::metrics::ReclaimMetrics;
use crate::oracle::{Usage, UsageOracle};

/// Reclaims soft-deleted blobs of one content store.
pub struct Reclaimer {
    store: Arc<dyn ContentStore>,
    ledger: Arc<dyn DeletionLedger>,
    oracle: Arc<dyn UsageOracle>,
    config: ReclaimConfig,
    metrics: ReclaimMetrics,
}

impl Reclaimer {
    pub fn new(
        store: Arc<dyn ContentStore>,
        ledger: Arc<dyn DeletionLedger>,
        oracle: Arc<dyn UsageOracle>,
        config: ReclaimConfig,
        metrics: ReclaimMetrics,
    ) -> Self {
        Self {
            store,
            ledger,
            oracle,
            config,
            metrics,
        }
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Run one pass over the ledger entries recorded before the pass began.
    ///
    /// Cancellation is checked before each batch; a batch in progress always
    /// finishes. Ledger failures abort the pass. Failures on individual blobs
    /// are counted and their entries kept.
    pub async fn reclaim(&self, cancel: &CancellationToken) -> Result<ReclaimResult> {
        let store_name = self.store.name();
        let batch_size = self.config.batch_size.max(1);
        let marked_before = Utc::now();
        let started = Instant::now();
        let mut result = ReclaimResult::new(store_name, self.config.dry_run);
        let mut cursor = LedgerCursor::START;

        self.metrics.record_pass_start();
        tracing::info!(
            store = store_name,
            batch_size,
            dry_run = self.config.dry_run,
            "Starting reclaim pass"
        );

        loop {
            if cancel.is_cancelled() {
                tracing::info!(store = store_name, "Reclaim pass cancelled");
                result.cancelled = true;
                break;
            }

            let batch = match self
                .ledger
                .drain_after(store_name, cursor, Some(marked_before), batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    self.metrics.record_pass_failure();
                    return Err(e).with_context(|| {
                        format!("Failed to read deletion ledger of blob store '{store_name}'")
                    });
                }
            };
            if batch.is_empty() {
                break;
            }

            result.batches += 1;
            self.metrics.record_examined(batch.len() as u64);
            tracing::debug!(
                store = store_name,
                batch = result.batches,
                entries = batch.len(),
                "Processing reclaim batch"
            );

            for record in &batch {
                cursor = record.cursor();
                result.examined += 1;
                if let Err(e) = self.reclaim_record(record, &mut result).await {
                    self.metrics.record_pass_failure();
                    return Err(e);
                }
            }

            if batch.len() < batch_size {
                break;
            }

            if !self.config.batch_pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.batch_pause) => {}
                }
            }
        }

        self.metrics.record_pass_complete(started.elapsed());
        result.log();
        Ok(result)
    }

    async fn reclaim_record(
        &self,
        record: &DeletionRecord,
        result: &mut ReclaimResult,
    ) -> Result<()> {
        let store_name = self.store.name();
        let blob_id = &record.blob_id;

        match self.oracle.is_referenced(store_name, blob_id).await {
            Usage::Referenced => {
                tracing::debug!(store = store_name, %blob_id, "Blob still referenced, keeping");
                result.retained_referenced += 1;
                self.metrics.record_retained();
                return Ok(());
            }
            Usage::Unknown => {
                result.retained_unknown += 1;
                self.metrics.record_retained();
                return Ok(());
            }
            Usage::NotReferenced => {}
        }

        // An undeleted blob is live again even though nothing references it yet
        match self.store.exists(blob_id).await {
            Ok(false) => {}
            Ok(true) => {
                if self.config.dry_run {
                    tracing::info!(store = store_name, %blob_id, "[DRY-RUN] Would drop ledger entry of undeleted blob");
                } else {
                    tracing::info!(store = store_name, %blob_id, "Blob was undeleted, dropping its ledger entry");
                    self.remove_entry(record).await?;
                }
                result.restored += 1;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(store = store_name, %blob_id, error = %e, "Cannot read blob state, keeping ledger entry");
                result.failed += 1;
                self.metrics.record_hard_delete_failure();
                return Ok(());
            }
        }

        if self.config.dry_run {
            tracing::info!(
                store = store_name,
                %blob_id,
                blob_name = %record.blob_name,
                marked_at = %record.marked_at,
                "[DRY-RUN] Would hard delete blob"
            );
            result.hard_deleted += 1;
            return Ok(());
        }

        match self.store.hard_delete(blob_id).await {
            Ok(content_present) => {
                if !content_present {
                    tracing::info!(store = store_name, %blob_id, "Blob content already absent, clearing ledger entry");
                }
                self.remove_entry(record).await?;
                if content_present {
                    result.hard_deleted += 1;
                } else {
                    result.content_missing += 1;
                }
                self.metrics.record_hard_delete(content_present);
            }
            Err(BlobStoreError::NotDeleted(_)) => {
                tracing::info!(store = store_name, %blob_id, "Blob was undeleted, dropping its ledger entry");
                self.remove_entry(record).await?;
                result.restored += 1;
            }
            Err(e) => {
                tracing::warn!(
                    store = store_name,
                    %blob_id,
                    error = %e,
                    "Hard delete failed, will retry next pass"
                );
                result.failed += 1;
                self.metrics.record_hard_delete_failure();
            }
        }
        Ok(())
    }

    async fn remove_entry(&self, record: &DeletionRecord) -> Result<()> {
        self.ledger
            .remove(record.record_id)
            .await
            .with_context(|| format!("Failed to remove ledger entry {}", record.record_id))?;
        Ok(())
    }

    /// Record a ledger entry for every soft-deleted blob of the store that
    /// has none. Returns how many entries were added.
    pub async fn rebuild_ledger(&self) -> Result<u64> {
        let store_name = self.store.name();
        let soft_deleted = self
            .store
            .soft_deleted()
            .await
            .with_context(|| format!("Failed to list soft-deleted blobs of '{store_name}'"))?;

        let mut added = 0;
        for blob in &soft_deleted {
            if self.ledger.contains(store_name, &blob.id).await? {
                continue;
            }
            self.ledger
                .record(&blob.id, store_name, &blob.blob_name)
                .await?;
            added += 1;
        }

        tracing::info!(
            store = store_name,
            soft_deleted = soft_deleted.len(),
            added,
            "Rebuilt deletion ledger"
        );
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MockUsageOracle;
    use common::blob::BlobId;
    use common::ledger::InMemoryDeletionLedger;
    use common::testing::{
        FaultyContentStore, FaultyDeletionLedger, memory_content_store, put_sized,
    };
    use std::time::Duration;

    fn config(batch_size: usize) -> ReclaimConfig {
        ReclaimConfig {
            batch_size,
            batch_pause: Duration::ZERO,
            ..Default::default()
        }
    }

    fn oracle(usage: Usage) -> Arc<dyn UsageOracle> {
        let mut oracle = MockUsageOracle::new();
        oracle.expect_is_referenced().returning(move |_, _| usage);
        Arc::new(oracle)
    }

    struct Fixture {
        store: Arc<dyn ContentStore>,
        ledger: Arc<InMemoryDeletionLedger>,
    }

    impl Fixture {
        async fn new() -> Self {
            Self {
                store: memory_content_store("default").await,
                ledger: Arc::new(InMemoryDeletionLedger::new()),
            }
        }

        /// Put a blob, soft delete it and record the deletion.
        async fn deleted_blob(&self, name: &str) -> BlobId {
            let id = put_sized(self.store.as_ref(), "maven", name, 10).await;
            assert!(self.store.soft_delete(&id, "test").await.unwrap());
            self.ledger.record(&id, "default", name).await.unwrap();
            id
        }

        fn reclaimer(&self, usage: Usage, config: ReclaimConfig) -> Reclaimer {
            Reclaimer::new(
                self.store.clone(),
                self.ledger.clone(),
                oracle(usage),
                config,
                ReclaimMetrics::new(),
            )
        }
    }

    #[tokio::test]
    async fn test_unreferenced_blobs_are_reclaimed() {
        let f = Fixture::new().await;
        let a = f.deleted_blob("a").await;
        let b = f.deleted_blob("b").await;

        let result = f
            .reclaimer(Usage::NotReferenced, config(10))
            .reclaim(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.examined, 2);
        assert_eq!(result.hard_deleted, 2);
        assert_eq!(f.ledger.count("default").await.unwrap(), 0);
        for id in [a, b] {
            assert!(matches!(
                f.store.get_including_deleted(&id).await,
                Err(BlobStoreError::NotFound(_))
            ));
        }
        assert_eq!(f.store.stats().await.unwrap().blob_count, 0);
    }

    #[tokio::test]
    async fn test_referenced_and_unknown_blobs_are_retained() {
        for usage in [Usage::Referenced, Usage::Unknown] {
            let f = Fixture::new().await;
            let id = f.deleted_blob("a").await;
            let reclaimer = f.reclaimer(usage, config(10));

            for _ in 0..3 {
                let result = reclaimer.reclaim(&CancellationToken::new()).await.unwrap();
                assert_eq!(result.hard_deleted, 0);
                assert_eq!(result.retained(), 1);
            }

            let blob = f.store.get_including_deleted(&id).await.unwrap();
            assert_eq!(blob.content.len(), 10);
            assert_eq!(f.ledger.count("default").await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_retained_entries_do_not_starve_later_ones() {
        let f = Fixture::new().await;
        // A full first batch that will be retained, then one reclaimable blob
        let mut kept = Vec::new();
        for i in 0..3 {
            kept.push(f.deleted_blob(&format!("kept-{i}")).await);
        }
        let target = f.deleted_blob("target").await;

        let mut oracle = MockUsageOracle::new();
        let target_id = target.clone();
        oracle.expect_is_referenced().returning(move |_, id| {
            if *id == target_id {
                Usage::NotReferenced
            } else {
                Usage::Referenced
            }
        });
        let reclaimer = Reclaimer::new(
            f.store.clone(),
            f.ledger.clone(),
            Arc::new(oracle),
            config(3),
            ReclaimMetrics::new(),
        );

        let result = reclaimer.reclaim(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.batches, 2);
        assert_eq!(result.retained_referenced, 3);
        assert_eq!(result.hard_deleted, 1);
        assert!(!f.ledger.contains("default", &target).await.unwrap());
        assert_eq!(f.ledger.count("default").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_missing_content_clears_entry() {
        let f = Fixture::new().await;
        let id = f.deleted_blob("a").await;
        assert!(f.store.hard_delete(&id).await.unwrap());

        let result = f
            .reclaimer(Usage::NotReferenced, config(10))
            .reclaim(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.content_missing, 1);
        assert_eq!(result.hard_deleted, 0);
        assert_eq!(f.ledger.count("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_entries_for_one_blob() {
        let f = Fixture::new().await;
        let id = f.deleted_blob("a").await;
        f.ledger.record(&id, "default", "a").await.unwrap();

        let result = f
            .reclaimer(Usage::NotReferenced, config(10))
            .reclaim(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.hard_deleted, 1);
        assert_eq!(result.content_missing, 1);
        assert_eq!(f.ledger.count("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_undeleted_blob_is_kept() {
        let f = Fixture::new().await;
        let id = f.deleted_blob("a").await;
        assert!(f.store.undelete(&id).await.unwrap());

        let result = f
            .reclaimer(Usage::NotReferenced, config(10))
            .reclaim(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.restored, 1);
        assert!(f.store.get(&id).await.is_ok());
        assert_eq!(f.ledger.count("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let f = Fixture::new().await;
        let id = f.deleted_blob("a").await;
        let config = ReclaimConfig {
            dry_run: true,
            ..config(10)
        };

        let result = f
            .reclaimer(Usage::NotReferenced, config)
            .reclaim(&CancellationToken::new())
            .await
            .unwrap();

        assert!(result.dry_run);
        assert_eq!(result.hard_deleted, 1);
        assert!(f.store.get_including_deleted(&id).await.is_ok());
        assert_eq!(f.ledger.count("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let f = Fixture::new().await;
        f.deleted_blob("a").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = f
            .reclaimer(Usage::NotReferenced, config(10))
            .reclaim(&cancel)
            .await
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.examined, 0);
        assert_eq!(f.ledger.count("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_entries_of_other_stores_are_ignored() {
        let f = Fixture::new().await;
        f.ledger
            .record(&"elsewhere".parse().unwrap(), "other", "x")
            .await
            .unwrap();

        let result = f
            .reclaimer(Usage::NotReferenced, config(10))
            .reclaim(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.examined, 0);
        assert_eq!(f.ledger.count("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_ledger_adds_missing_entries() {
        let f = Fixture::new().await;
        let tracked = f.deleted_blob("tracked").await;
        let untracked = put_sized(f.store.as_ref(), "maven", "untracked", 5).await;
        f.store.soft_delete(&untracked, "lost entry").await.unwrap();
        put_sized(f.store.as_ref(), "maven", "live", 5).await;

        let reclaimer = f.reclaimer(Usage::NotReferenced, config(10));
        assert_eq!(reclaimer.rebuild_ledger().await.unwrap(), 1);
        assert_eq!(reclaimer.rebuild_ledger().await.unwrap(), 0);

        assert_eq!(f.ledger.count("default").await.unwrap(), 2);
        assert!(f.ledger.contains("default", &tracked).await.unwrap());
        assert!(f.ledger.contains("default", &untracked).await.unwrap());
    }

    /// A store and ledger whose operations can be made to fail.
    async fn faulty() -> (Arc<FaultyContentStore>, Arc<FaultyDeletionLedger>, BlobId) {
        let store = Arc::new(FaultyContentStore::new(
            memory_content_store("default").await,
        ));
        let ledger = Arc::new(FaultyDeletionLedger::new());
        let id = put_sized(store.as_ref(), "maven", "a", 10).await;
        assert!(store.soft_delete(&id, "test").await.unwrap());
        ledger.record(&id, "default", "a").await.unwrap();
        (store, ledger, id)
    }

    fn faulty_reclaimer(
        store: &Arc<FaultyContentStore>,
        ledger: &Arc<FaultyDeletionLedger>,
        metrics: ReclaimMetrics,
    ) -> Reclaimer {
        Reclaimer::new(
            store.clone(),
            ledger.clone(),
            oracle(Usage::NotReferenced),
            config(10),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_transient_hard_delete_error_keeps_entry() {
        let (store, ledger, id) = faulty().await;
        store.fail_hard_delete(true);
        let reclaimer = faulty_reclaimer(&store, &ledger, ReclaimMetrics::new());

        let result = reclaimer.reclaim(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.failed, 1);
        assert_eq!(result.hard_deleted, 0);
        assert_eq!((result.cleared(), result.retained()), (0, 1));
        assert_eq!(ledger.count("default").await.unwrap(), 1);
        assert!(store.get_including_deleted(&id).await.is_ok());

        // Next pass after the store recovers
        store.fail_hard_delete(false);
        let result = reclaimer.reclaim(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.hard_deleted, 1);
        assert_eq!(ledger.count("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ledger_read_failure_aborts_pass() {
        let (store, ledger, id) = faulty().await;
        ledger.fail_drain(true);
        let metrics = ReclaimMetrics::new();

        let err = faulty_reclaimer(&store, &ledger, metrics.clone())
            .reclaim(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("Failed to read deletion ledger"));
        assert_eq!(metrics.passes_failed(), 1);
        assert!(store.get_including_deleted(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_ledger_remove_failure_aborts_pass() {
        let (store, ledger, _) = faulty().await;
        ledger.fail_remove(true);
        let metrics = ReclaimMetrics::new();

        let err = faulty_reclaimer(&store, &ledger, metrics.clone())
            .reclaim(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("Failed to remove ledger entry"));
        assert_eq!(metrics.passes_failed(), 1);
        // Content is gone but the entry stays; the next pass clears it
        assert_eq!(ledger.count("default").await.unwrap(), 1);

        ledger.fail_remove(false);
        let result = faulty_reclaimer(&store, &ledger, ReclaimMetrics::new())
            .reclaim(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.content_missing, 1);
        assert_eq!(ledger.count("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_undelete_racing_the_existence_check_is_kept() {
        let (store, ledger, id) = faulty().await;
        assert!(store.undelete(&id).await.unwrap());
        // The reclaimer still sees the blob as deleted
        store.stale_exists(true);

        let result = faulty_reclaimer(&store, &ledger, ReclaimMetrics::new())
            .reclaim(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.restored, 1);
        assert_eq!(result.hard_deleted, 0);
        assert_eq!(result.cleared(), 1);
        assert!(store.get(&id).await.is_ok());
        assert_eq!(ledger.count("default").await.unwrap(), 0);
    }
}
