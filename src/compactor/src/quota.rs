//! Advisory quota classification of content stores.
//!
//! The evaluator never blocks writes. It reports whether a store's current
//! usage exceeds its configured limits; acting on that is up to the caller.

use std::collections::HashMap;

use common::BlobStoreRegistry;
use common::blob::BlobStoreStats;
use common::config::Configuration;

/// Optional per-store limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    pub max_size_bytes: Option<u64>,
    pub max_blob_count: Option<u64>,
}

impl QuotaLimits {
    pub fn is_unlimited(&self) -> bool {
        self.max_size_bytes.is_none() && self.max_blob_count.is_none()
    }

    /// Messages for every limit `stats` exceeds.
    fn violations(&self, stats: &BlobStoreStats) -> Vec<String> {
        let mut violations = Vec::new();
        if let Some(max) = self.max_size_bytes
            && stats.total_bytes > max
        {
            violations.push(format!(
                "total size {} bytes exceeds limit of {max} bytes",
                stats.total_bytes
            ));
        }
        if let Some(max) = self.max_blob_count
            && stats.blob_count > max
        {
            violations.push(format!(
                "blob count {} exceeds limit of {max}",
                stats.blob_count
            ));
        }
        violations
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaResult {
    pub store_name: String,
    pub is_violation: bool,
    pub message: String,
    pub stats: BlobStoreStats,
}

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("Unknown blob store '{0}'")]
    UnknownStore(String),
    #[error("Cannot read usage of blob store '{store}': {source}")]
    Stats {
        store: String,
        #[source]
        source: common::blob::BlobStoreError,
    },
}

pub struct QuotaEvaluator {
    registry: BlobStoreRegistry,
    limits: HashMap<String, QuotaLimits>,
}

impl QuotaEvaluator {
    pub fn new(registry: BlobStoreRegistry, limits: HashMap<String, QuotaLimits>) -> Self {
        Self { registry, limits }
    }

    /// Limits as configured under `[stores.<name>]`.
    pub fn from_config(registry: BlobStoreRegistry, config: &Configuration) -> Self {
        let limits = config
            .effective_stores()
            .into_iter()
            .map(|(name, store)| {
                (
                    name,
                    QuotaLimits {
                        max_size_bytes: store.max_size_bytes,
                        max_blob_count: store.max_blob_count,
                    },
                )
            })
            .collect();
        Self::new(registry, limits)
    }

    pub fn limits(&self, store_name: &str) -> QuotaLimits {
        self.limits.get(store_name).copied().unwrap_or_default()
    }

    /// Classify the current usage of one store.
    pub async fn check_quota(&self, store_name: &str) -> Result<QuotaResult, QuotaError> {
        let store = self
            .registry
            .get(store_name)
            .ok_or_else(|| QuotaError::UnknownStore(store_name.to_string()))?;
        let stats = store.stats().await.map_err(|source| QuotaError::Stats {
            store: store_name.to_string(),
            source,
        })?;

        let limits = self.limits(store_name);
        let violations = limits.violations(&stats);
        let is_violation = !violations.is_empty();
        let message = if limits.is_unlimited() {
            format!("Blob store '{store_name}' has no quota")
        } else if is_violation {
            format!("Blob store '{store_name}' over quota: {}", violations.join("; "))
        } else {
            format!(
                "Blob store '{store_name}' within quota ({} bytes, {} blobs)",
                stats.total_bytes, stats.blob_count
            )
        };

        Ok(QuotaResult {
            store_name: store_name.to_string(),
            is_violation,
            message,
            stats,
        })
    }

    /// Check every registered store, logging violations.
    pub async fn check_all(&self) -> Vec<Result<QuotaResult, QuotaError>> {
        let mut results = Vec::with_capacity(self.registry.len());
        for name in self.registry.names() {
            let result = self.check_quota(name).await;
            match &result {
                Ok(quota) if quota.is_violation => {
                    tracing::warn!(store = name, "{}", quota.message)
                }
                Ok(quota) => tracing::debug!(store = name, "{}", quota.message),
                Err(e) => tracing::error!(store = name, error = %e, "Quota check failed"),
            }
            results.push(result);
        }
        results
    }
}
