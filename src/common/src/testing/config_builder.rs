//! Test configuration builder for creating test setups quickly.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::{
    BlobStoreConfig, CleanupMode, CleanupPolicyConfig, Configuration, DatabaseConfig,
    RepositoryConfig,
};

/// Fluent builder for configurations suitable for testing.
///
/// ```rust,ignore
/// use common::testing::TestConfigBuilder;
///
/// let config = TestConfigBuilder::new()
///     .in_memory()
///     .with_repository("maven-releases", "maven2", "default", &["old-snapshots"])
///     .with_policy("old-snapshots", "maven2", &[("lastBlobUpdated", "30")])
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Configuration::default(),
        }
    }

    /// In-memory SQLite database, short pauses so tests don't sleep.
    pub fn in_memory(mut self) -> Self {
        self.config.database = DatabaseConfig::in_memory();
        self.config.compactor.reclaim.batch_pause = Duration::ZERO;
        self.config.compactor.retry.base_delay = Duration::from_millis(1);
        self.config.compactor.retry.max_delay = Duration::from_millis(5);
        self
    }

    /// Add an in-memory store with optional quota limits.
    pub fn with_store(
        mut self,
        name: &str,
        max_size_bytes: Option<u64>,
        max_blob_count: Option<u64>,
    ) -> Self {
        self.config.stores.insert(
            name.to_string(),
            BlobStoreConfig {
                dsn: "memory://".to_string(),
                max_size_bytes,
                max_blob_count,
            },
        );
        self
    }

    pub fn with_repository(
        mut self,
        name: &str,
        format: &str,
        blob_store: &str,
        policies: &[&str],
    ) -> Self {
        self.config.repositories.push(RepositoryConfig {
            name: name.to_string(),
            format: format.to_string(),
            blob_store: blob_store.to_string(),
            cleanup_policies: policies.iter().map(|p| p.to_string()).collect(),
        });
        self
    }

    pub fn with_policy(mut self, name: &str, format: &str, criteria: &[(&str, &str)]) -> Self {
        self.config.cleanup_policies.push(CleanupPolicyConfig {
            name: name.to_string(),
            format: format.to_string(),
            mode: CleanupMode::Delete,
            criteria: criteria
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        });
        self
    }

    /// Switch the most recently added policy to preview mode.
    pub fn preview(mut self) -> Self {
        if let Some(policy) = self.config.cleanup_policies.last_mut() {
            policy.mode = CleanupMode::Preview;
        }
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }
}
