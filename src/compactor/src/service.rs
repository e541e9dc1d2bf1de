//! Background service wiring the reclaimers, the cleanup runner and the
//! quota check onto their schedules.

use std::sync::Arc;
use std::time::Duration;

use common::BlobStoreRegistry;
use common::config::{CompactorConfig, Configuration};
use common::ledger::DeletionLedger;
use common::metadata::MetadataStore;
use common::retry::RetryPolicy;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cleanup::{BulkDeletionCoordinator, CleanupService};
use crate::metrics::ReclaimMetrics;
use crate::oracle::{MetadataUsageOracle, UsageOracle};
use crate::quota::QuotaEvaluator;
use crate::reclaim::Reclaimer;

pub struct CompactorService {
    config: CompactorConfig,
    reclaimers: Vec<Arc<Reclaimer>>,
    cleanup: Arc<CleanupService>,
    quota: Arc<QuotaEvaluator>,
    metrics: ReclaimMetrics,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CompactorService {
    /// Build every component in dependency order. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        config: &Configuration,
        registry: BlobStoreRegistry,
        ledger: Arc<dyn DeletionLedger>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let compactor = config.compactor.clone();
        let retry = RetryPolicy::from(&compactor.retry);
        let metrics = ReclaimMetrics::new();
        let oracle: Arc<dyn UsageOracle> =
            Arc::new(MetadataUsageOracle::new(metadata.clone(), retry.clone()));

        let reclaimers = registry
            .stores()
            .map(|store| {
                Arc::new(Reclaimer::new(
                    store.clone(),
                    ledger.clone(),
                    oracle.clone(),
                    compactor.reclaim.clone(),
                    metrics.clone(),
                ))
            })
            .collect();

        let coordinator = BulkDeletionCoordinator::new(
            metadata.clone(),
            registry.clone(),
            ledger,
            oracle,
            retry,
            metrics.clone(),
        );
        let cleanup = Arc::new(CleanupService::new(config.clone(), metadata, coordinator));
        let quota = Arc::new(QuotaEvaluator::from_config(registry, config));

        Self {
            config: compactor,
            reclaimers,
            cleanup,
            quota,
            metrics,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn reclaimer(&self, store_name: &str) -> Option<Arc<Reclaimer>> {
        self.reclaimers
            .iter()
            .find(|r| r.store_name() == store_name)
            .cloned()
    }

    pub fn cleanup(&self) -> Arc<CleanupService> {
        self.cleanup.clone()
    }

    pub fn quota(&self) -> Arc<QuotaEvaluator> {
        self.quota.clone()
    }

    pub fn metrics(&self) -> ReclaimMetrics {
        self.metrics.clone()
    }

    /// Token observed by every background loop.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the background loops. Each loop runs once immediately and then
    /// on its interval.
    pub fn start(&mut self) {
        if !self.config.enabled {
            tracing::info!("Compactor is disabled (compactor.enabled = false)");
            return;
        }
        if !self.tasks.is_empty() {
            tracing::warn!("Compactor service already started");
            return;
        }

        if self.config.reclaim.enabled {
            for reclaimer in &self.reclaimers {
                self.tasks.push(spawn_reclaim_loop(
                    reclaimer.clone(),
                    self.config.reclaim.interval,
                    self.config.reclaim.rebuild_ledger_on_start,
                    self.metrics.clone(),
                    self.cancel.clone(),
                ));
            }
        }

        if self.config.cleanup.enabled {
            let cleanup = self.cleanup.clone();
            let cancel = self.cancel.clone();
            self.tasks.push(spawn_periodic(
                "cleanup",
                self.config.cleanup.interval,
                self.cancel.clone(),
                move || {
                    let cleanup = cleanup.clone();
                    let cancel = cancel.clone();
                    async move {
                        if let Err(e) = cleanup.run(&cancel).await {
                            tracing::error!(error = %format!("{e:#}"), "Cleanup run failed");
                        }
                    }
                },
            ));
        }

        if self.config.quota.enabled {
            let quota = self.quota.clone();
            self.tasks.push(spawn_periodic(
                "quota",
                self.config.quota.interval,
                self.cancel.clone(),
                move || {
                    let quota = quota.clone();
                    async move {
                        quota.check_all().await;
                    }
                },
            ));
        }

        tracing::info!(
            reclaimers = self.reclaimers.len(),
            tasks = self.tasks.len(),
            "Compactor service started"
        );
    }

    /// Cancel every loop and wait for it to finish its current batch.
    pub async fn stop(mut self) {
        tracing::info!("Stopping compactor service");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Compactor task panicked");
            }
        }
        self.metrics.summary().log();
        tracing::info!("Compactor service stopped");
    }
}

fn spawn_reclaim_loop(
    reclaimer: Arc<Reclaimer>,
    interval: Duration,
    rebuild_first: bool,
    metrics: ReclaimMetrics,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if rebuild_first
            && let Err(e) = reclaimer.rebuild_ledger().await
        {
            tracing::error!(
                store = reclaimer.store_name(),
                error = %format!("{e:#}"),
                "Ledger rebuild failed"
            );
        }

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match reclaimer.reclaim(&cancel).await {
                Ok(_) => metrics.summary().log(),
                Err(e) => tracing::error!(
                    store = reclaimer.store_name(),
                    error = %format!("{e:#}"),
                    "Reclaim pass failed"
                ),
            }
        }
        tracing::debug!(store = reclaimer.store_name(), "Reclaim loop stopped");
    })
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tick().await;
        }
        tracing::debug!(task = name, "Periodic task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ledger::InMemoryDeletionLedger;
    use common::metadata::InMemoryMetadataStore;
    use common::testing::{TestConfigBuilder, put_sized};

    async fn service(
        config: &Configuration,
    ) -> (
        CompactorService,
        Arc<InMemoryDeletionLedger>,
        BlobStoreRegistry,
    ) {
        let registry = BlobStoreRegistry::from_config(config).await.unwrap();
        let ledger = Arc::new(InMemoryDeletionLedger::new());
        let service = CompactorService::new(
            config,
            registry.clone(),
            ledger.clone(),
            Arc::new(InMemoryMetadataStore::new()),
        );
        (service, ledger, registry)
    }

    #[tokio::test]
    async fn test_background_reclaim_runs_on_start() {
        let config = TestConfigBuilder::new().in_memory().build();
        let (mut service, ledger, registry) = service(&config).await;
        let store = registry.get("default").unwrap();
        let id = put_sized(store.as_ref(), "r", "a", 8).await;
        store.soft_delete(&id, "test").await.unwrap();
        ledger.record(&id, "default", "a").await.unwrap();

        service.start();
        for _ in 0..100 {
            if ledger.count("default").await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let metrics = service.metrics();
        service.stop().await;

        assert_eq!(ledger.count("default").await.unwrap(), 0);
        assert_eq!(metrics.blobs_hard_deleted(), 1);
        assert_eq!(store.stats().await.unwrap().blob_count, 0);
    }

    #[tokio::test]
    async fn test_disabled_service_spawns_nothing() {
        let mut config = TestConfigBuilder::new().in_memory().build();
        config.compactor.enabled = false;
        let (mut service, _, _) = service(&config).await;

        service.start();
        assert!(service.tasks.is_empty());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_loops() {
        let config = TestConfigBuilder::new().in_memory().build();
        let (mut service, _, _) = service(&config).await;
        let cancel = service.cancellation_token();

        service.start();
        assert!(!cancel.is_cancelled());
        tokio::time::timeout(Duration::from_secs(5), service.stop())
            .await
            .unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_reclaimer_lookup() {
        let config = TestConfigBuilder::new()
            .in_memory()
            .with_store("alpha", None, None)
            .with_store("beta", None, None)
            .build();
        let (service, _, _) = service(&config).await;

        assert!(service.reclaimer("alpha").is_some());
        assert!(service.reclaimer("beta").is_some());
        assert!(service.reclaimer("default").is_none());
    }
}
