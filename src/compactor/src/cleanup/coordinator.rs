//! Batched removal of components/assets with soft deletion of the blobs
//! that become unreferenced.

use std::sync::Arc;

use anyhow::{Context, Result};
use common::BlobStoreRegistry;
use common::ledger::DeletionLedger;
use common::metadata::{BlobRef, ItemId, MetadataStore};
use common::retry::RetryPolicy;
use tokio_util::sync::CancellationToken;

use super::DeletionProgress;
use crate::metrics::ReclaimMetrics;
use crate::oracle::{Usage, UsageOracle};

/// Default number of items removed per batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

pub struct BulkDeletionCoordinator {
    metadata: Arc<dyn MetadataStore>,
    registry: BlobStoreRegistry,
    ledger: Arc<dyn DeletionLedger>,
    oracle: Arc<dyn UsageOracle>,
    retry: RetryPolicy,
    metrics: ReclaimMetrics,
}

impl BulkDeletionCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        registry: BlobStoreRegistry,
        ledger: Arc<dyn DeletionLedger>,
        oracle: Arc<dyn UsageOracle>,
        retry: RetryPolicy,
        metrics: ReclaimMetrics,
    ) -> Self {
        Self {
            metadata,
            registry,
            ledger,
            oracle,
            retry,
            metrics,
        }
    }

    /// Delete `items` of `repository` in ordered batches of `batch_size`.
    ///
    /// Cancellation is checked before each batch. Committed batches are
    /// final. A batch whose metadata removal keeps failing ends the run with
    /// `failed_batches` set; the remaining items are left untouched. Ledger
    /// failures are returned as errors.
    pub async fn delete_items(
        &self,
        repository: &str,
        items: &[ItemId],
        cancel: &CancellationToken,
        batch_size: usize,
    ) -> Result<DeletionProgress> {
        let batch_size = batch_size.max(1);
        let total_batches = items.len().div_ceil(batch_size);
        let mut progress = DeletionProgress::default();

        tracing::info!(
            repository,
            items = items.len(),
            batch_size,
            total_batches,
            "Starting bulk deletion"
        );

        for (batch_idx, batch) in items.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(
                    repository,
                    completed_batches = batch_idx,
                    total_batches,
                    deleted = progress.count,
                    "Bulk deletion cancelled"
                );
                progress.cancelled = true;
                break;
            }

            let removed = self
                .retry
                .run("metadata batch removal", || {
                    self.metadata.delete_items(repository, batch)
                })
                .await;
            let removed = match removed {
                Ok(removed) => removed,
                Err(e) => {
                    tracing::error!(
                        repository,
                        batch = batch_idx + 1,
                        total_batches,
                        error = %e,
                        "Failed to remove metadata batch"
                    );
                    progress.failed_batches += 1;
                    break;
                }
            };

            progress.batches += 1;
            progress.count += batch.len() as u64;
            progress.components_deleted += removed.components;
            progress.assets_deleted += removed.assets;

            let soft_deleted_before = progress.blobs_soft_deleted;
            for blob in &removed.blobs {
                self.release_blob(repository, blob, &mut progress).await?;
            }
            self.metrics.record_bulk_deletion(
                batch.len() as u64,
                progress.blobs_soft_deleted - soft_deleted_before,
            );

            tracing::debug!(
                repository,
                batch = batch_idx + 1,
                total_batches,
                components = removed.components,
                assets = removed.assets,
                blobs = removed.blobs.len(),
                "Committed deletion batch"
            );
        }

        tracing::info!(
            repository,
            count = progress.count,
            components = progress.components_deleted,
            assets = progress.assets_deleted,
            soft_deleted = progress.blobs_soft_deleted,
            retained = progress.blobs_retained,
            cancelled = progress.cancelled,
            "Bulk deletion finished"
        );
        Ok(progress)
    }

    /// Soft delete a blob of a removed asset unless the remaining metadata
    /// still references it.
    async fn release_blob(
        &self,
        repository: &str,
        blob: &BlobRef,
        progress: &mut DeletionProgress,
    ) -> Result<()> {
        let Some(store) = self.registry.get(&blob.store_name) else {
            tracing::error!(
                store = %blob.store_name,
                blob_id = %blob.blob_id,
                "Asset refers to an unknown blob store"
            );
            progress.blobs_failed += 1;
            return Ok(());
        };

        match self
            .oracle
            .is_referenced(&blob.store_name, &blob.blob_id)
            .await
        {
            Usage::Referenced | Usage::Unknown => {
                progress.blobs_retained += 1;
                return Ok(());
            }
            Usage::NotReferenced => {}
        }

        let reason = format!("Removed from repository {repository}");
        match store.soft_delete(&blob.blob_id, &reason).await {
            Ok(true) => {
                self.ledger
                    .record(&blob.blob_id, &blob.store_name, &blob.blob_name)
                    .await
                    .with_context(|| {
                        format!("Failed to record deletion of blob {}", blob.blob_id)
                    })?;
                progress.blobs_soft_deleted += 1;
            }
            Ok(false) => {
                tracing::warn!(
                    store = %blob.store_name,
                    blob_id = %blob.blob_id,
                    "Blob of removed asset does not exist"
                );
                progress.blobs_missing += 1;
            }
            Err(e) => {
                tracing::error!(
                    store = %blob.store_name,
                    blob_id = %blob.blob_id,
                    error = %e,
                    "Failed to soft delete blob of removed asset"
                );
                progress.blobs_failed += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MetadataUsageOracle;
    use common::blob::{BlobId, BlobStoreError, ContentStore};
    use common::metadata::{InMemoryMetadataStore, NewAsset};
    use common::testing::{
        FaultyContentStore, FaultyDeletionLedger, memory_content_store, put_sized,
    };

    struct Fixture {
        store: Arc<FaultyContentStore>,
        metadata: Arc<InMemoryMetadataStore>,
        ledger: Arc<FaultyDeletionLedger>,
        coordinator: BulkDeletionCoordinator,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = Arc::new(FaultyContentStore::new(
                memory_content_store("default").await,
            ));
            let mut registry = BlobStoreRegistry::new();
            registry.register(store.clone());
            let metadata = Arc::new(InMemoryMetadataStore::new());
            let ledger = Arc::new(FaultyDeletionLedger::new());
            let oracle = Arc::new(MetadataUsageOracle::new(
                metadata.clone(),
                RetryPolicy::none(),
            ));
            let coordinator = BulkDeletionCoordinator::new(
                metadata.clone(),
                registry,
                ledger.clone(),
                oracle,
                RetryPolicy::none(),
                ReclaimMetrics::new(),
            );
            Self {
                store,
                metadata,
                ledger,
                coordinator,
            }
        }

        /// A component with one asset backed by `blob`.
        async fn component(&self, name: &str, blob: &BlobId) -> ItemId {
            let id = self
                .metadata
                .create_component("maven", name, "1.0")
                .await
                .unwrap();
            self.metadata
                .create_asset(NewAsset {
                    component_id: Some(id),
                    repository: "maven".to_string(),
                    path: format!("{name}/1.0/{name}.jar"),
                    blob: BlobRef {
                        store_name: "default".to_string(),
                        blob_id: blob.clone(),
                        blob_name: format!("{name}.jar"),
                    },
                    blob_updated: chrono::Utc::now(),
                    last_downloaded: None,
                })
                .await
                .unwrap();
            ItemId::Component(id)
        }
    }

    #[tokio::test]
    async fn test_unreferenced_blobs_are_soft_deleted() {
        let f = Fixture::new().await;
        let blob = put_sized(f.store.as_ref(), "maven", "a.jar", 10).await;
        let item = f.component("a", &blob).await;

        let progress = f
            .coordinator
            .delete_items("maven", &[item], &CancellationToken::new(), 500)
            .await
            .unwrap();

        assert_eq!(progress.count, 1);
        assert_eq!(progress.components_deleted, 1);
        assert_eq!(progress.assets_deleted, 1);
        assert_eq!(progress.blobs_soft_deleted, 1);
        assert!(matches!(
            f.store.get(&blob).await,
            Err(BlobStoreError::NotFound(_))
        ));
        assert!(f.ledger.contains("default", &blob).await.unwrap());
        // Bytes stay until reclaimed
        assert_eq!(f.store.stats().await.unwrap().blob_count, 1);
    }

    #[tokio::test]
    async fn test_shared_blob_survives_until_last_reference() {
        let f = Fixture::new().await;
        let shared = put_sized(f.store.as_ref(), "maven", "shared.jar", 10).await;
        let first = f.component("first", &shared).await;
        let second = f.component("second", &shared).await;

        let progress = f
            .coordinator
            .delete_items("maven", &[first], &CancellationToken::new(), 500)
            .await
            .unwrap();
        assert_eq!(progress.blobs_retained, 1);
        assert!(f.store.get(&shared).await.is_ok());
        assert_eq!(f.ledger.count("default").await.unwrap(), 0);

        let progress = f
            .coordinator
            .delete_items("maven", &[second], &CancellationToken::new(), 500)
            .await
            .unwrap();
        assert_eq!(progress.blobs_soft_deleted, 1);
        assert!(f.store.get(&shared).await.is_err());
    }

    #[tokio::test]
    async fn test_batches_are_partitioned() {
        let f = Fixture::new().await;
        let mut items = Vec::new();
        for i in 0..7 {
            let blob = put_sized(f.store.as_ref(), "maven", &format!("{i}.jar"), 1).await;
            items.push(f.component(&format!("c{i}"), &blob).await);
        }

        let progress = f
            .coordinator
            .delete_items("maven", &items, &CancellationToken::new(), 3)
            .await
            .unwrap();

        assert_eq!(progress.batches, 3);
        assert_eq!(progress.count, 7);
        assert_eq!(progress.blobs_soft_deleted, 7);
        assert_eq!(f.ledger.count("default").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let f = Fixture::new().await;
        let blob = put_sized(f.store.as_ref(), "maven", "a.jar", 1).await;
        let item = f.component("a", &blob).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let progress = f
            .coordinator
            .delete_items("maven", &[item], &cancel, 500)
            .await
            .unwrap();

        assert!(progress.cancelled);
        assert_eq!(progress.count, 0);
        assert_eq!(f.metadata.component_count("maven").await, 1);
    }

    #[tokio::test]
    async fn test_missing_blob_is_counted() {
        let f = Fixture::new().await;
        let ghost: BlobId = "never-stored".parse().unwrap();
        let item = f.component("ghost", &ghost).await;

        let progress = f
            .coordinator
            .delete_items("maven", &[item], &CancellationToken::new(), 500)
            .await
            .unwrap();

        assert_eq!(progress.blobs_missing, 1);
        assert!(!progress.is_failed());
        assert_eq!(f.ledger.count("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ledger_record_failure_aborts_deletion() {
        let f = Fixture::new().await;
        let blob = put_sized(f.store.as_ref(), "maven", "a.jar", 10).await;
        let item = f.component("a", &blob).await;
        f.ledger.fail_record(true);

        let err = f
            .coordinator
            .delete_items("maven", &[item], &CancellationToken::new(), 500)
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("Failed to record deletion of blob"));
        // Soft deleted without an entry; a ledger rebuild recovers it
        assert!(f.store.get(&blob).await.is_err());
        assert_eq!(f.store.soft_deleted().await.unwrap().len(), 1);
        assert_eq!(f.metadata.component_count("maven").await, 0);
        assert_eq!(f.ledger.count("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_soft_delete_failure_marks_run_failed() {
        let f = Fixture::new().await;
        let blob = put_sized(f.store.as_ref(), "maven", "a.jar", 10).await;
        let item = f.component("a", &blob).await;
        f.store.fail_soft_delete(true);

        let progress = f
            .coordinator
            .delete_items("maven", &[item], &CancellationToken::new(), 500)
            .await
            .unwrap();

        assert_eq!(progress.count, 1);
        assert_eq!(progress.blobs_failed, 1);
        assert!(progress.is_failed());
        assert!(f.store.get(&blob).await.is_ok());
        assert_eq!(f.ledger.count("default").await.unwrap(), 0);
    }
}
