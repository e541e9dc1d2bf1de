use std::sync::Arc;

use anyhow::Result;
use common::config::{CleanupConfig, CleanupMode, Configuration, RepositoryConfig};
use common::metadata::{CleanupCriteria, ItemId, MetadataStore};
use common::retry::RetryPolicy;
use tokio_util::sync::CancellationToken;

use super::{BulkDeletionCoordinator, DeletionProgress};

/// Outcome of applying one policy to one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRun {
    pub repository: String,
    pub policy: String,
    pub mode: CleanupMode,
    /// Items the policy selected on the last attempt
    pub matched: u64,
    pub progress: DeletionProgress,
    pub attempts: u32,
    /// Last error when every attempt failed
    pub error: Option<String>,
}

impl PolicyRun {
    fn new(repository: &str, policy: &str, mode: CleanupMode) -> Self {
        Self {
            repository: repository.to_string(),
            policy: policy.to_string(),
            mode,
            matched: 0,
            progress: DeletionProgress::default(),
            attempts: 0,
            error: None,
        }
    }
}

/// Applies configured cleanup policies to repositories.
pub struct CleanupService {
    config: Configuration,
    metadata: Arc<dyn MetadataStore>,
    coordinator: BulkDeletionCoordinator,
    retry: RetryPolicy,
}

impl CleanupService {
    pub fn new(
        config: Configuration,
        metadata: Arc<dyn MetadataStore>,
        coordinator: BulkDeletionCoordinator,
    ) -> Self {
        let retry = RetryPolicy::from(&config.compactor.retry);
        Self {
            config,
            metadata,
            coordinator,
            retry,
        }
    }

    fn settings(&self) -> &CleanupConfig {
        &self.config.compactor.cleanup
    }

    /// Run every repository's policies. Stops between repositories once
    /// `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Vec<PolicyRun>> {
        let mut runs = Vec::new();

        for repository in &self.config.repositories {
            if cancel.is_cancelled() {
                tracing::info!("Cleanup cancelled before repository '{}'", repository.name);
                break;
            }
            runs.extend(self.run_repository(repository, cancel).await?);
        }

        Ok(runs)
    }

    async fn run_repository(
        &self,
        repository: &RepositoryConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<PolicyRun>> {
        let mut runs = Vec::new();

        for policy_name in &repository.cleanup_policies {
            let Some(policy) = self.config.policy(policy_name) else {
                tracing::warn!(
                    repository = %repository.name,
                    policy = %policy_name,
                    "Cleanup policy not found, skipping"
                );
                continue;
            };
            if !policy.applies_to(&repository.format) {
                tracing::warn!(
                    repository = %repository.name,
                    policy = %policy_name,
                    policy_format = %policy.format,
                    repository_format = %repository.format,
                    "Cleanup policy format does not match repository, skipping"
                );
                continue;
            }
            let criteria = match CleanupCriteria::from_map(&policy.criteria) {
                Ok(criteria) => criteria,
                Err(e) => {
                    tracing::warn!(
                        repository = %repository.name,
                        policy = %policy_name,
                        error = %e,
                        "Invalid cleanup criteria, skipping"
                    );
                    continue;
                }
            };
            if criteria.is_empty() {
                tracing::warn!(
                    repository = %repository.name,
                    policy = %policy_name,
                    "Cleanup policy has no criteria, skipping"
                );
                continue;
            }

            let run = self
                .run_policy(&repository.name, policy_name, policy.mode, &criteria, cancel)
                .await?;
            let stop = run.progress.cancelled;
            runs.push(run);
            if stop {
                break;
            }
        }

        Ok(runs)
    }

    /// Apply one policy, re-resolving and retrying the whole run when it
    /// fails.
    async fn run_policy(
        &self,
        repository: &str,
        policy: &str,
        mode: CleanupMode,
        criteria: &CleanupCriteria,
        cancel: &CancellationToken,
    ) -> Result<PolicyRun> {
        let max_attempts = self.settings().max_attempts.max(1);
        let mut run = PolicyRun::new(repository, policy, mode);

        for attempt in 1..=max_attempts {
            run.attempts = attempt;

            let items = match self.resolve(repository, criteria).await {
                Ok(items) => items,
                Err(e) => {
                    run.error = Some(e.to_string());
                    if !self.wait_before_retry(repository, policy, attempt, cancel).await {
                        break;
                    }
                    continue;
                }
            };
            run.matched = items.len() as u64;

            if mode == CleanupMode::Preview {
                tracing::info!(
                    repository,
                    policy,
                    matched = run.matched,
                    "Cleanup preview: components that would be deleted"
                );
                run.error = None;
                break;
            }

            let progress = self
                .coordinator
                .delete_items(repository, &items, cancel, self.settings().batch_size)
                .await;
            match progress {
                Ok(progress) => {
                    run.progress.merge(&progress);
                    if progress.cancelled || !progress.is_failed() {
                        run.error = None;
                        break;
                    }
                    run.error = Some(format!(
                        "{} failed batches, {} failed blobs",
                        progress.failed_batches, progress.blobs_failed
                    ));
                }
                Err(e) => run.error = Some(format!("{e:#}")),
            }

            if !self.wait_before_retry(repository, policy, attempt, cancel).await {
                break;
            }
        }

        if let Some(error) = &run.error {
            tracing::error!(
                repository,
                policy,
                attempts = run.attempts,
                error = %error,
                "Cleanup run failed"
            );
        } else {
            tracing::info!(
                repository,
                policy,
                matched = run.matched,
                deleted = run.progress.count,
                soft_deleted = run.progress.blobs_soft_deleted,
                "Cleanup run finished"
            );
        }
        Ok(run)
    }

    async fn resolve(
        &self,
        repository: &str,
        criteria: &CleanupCriteria,
    ) -> Result<Vec<ItemId>, common::metadata::MetadataError> {
        self.retry
            .run("cleanup policy resolution", || {
                self.metadata.find_components(repository, criteria)
            })
            .await
    }

    /// Back off before the next attempt. False when no attempt should follow.
    async fn wait_before_retry(
        &self,
        repository: &str,
        policy: &str,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> bool {
        if attempt >= self.settings().max_attempts || cancel.is_cancelled() {
            return false;
        }
        let delay = self.retry.delay_for(attempt);
        tracing::warn!(
            repository,
            policy,
            attempt,
            max_attempts = self.settings().max_attempts,
            "Cleanup run failed, retrying after {delay:?}"
        );
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
