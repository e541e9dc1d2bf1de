use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::metadata::CleanupCriteria;

/// Name of the store used when no store is configured.
pub const DEFAULT_STORE_NAME: &str = "default";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// DSN for the deletion ledger and metadata tables (PostgreSQL or SQLite)
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/blobkeeper.db"),
        }
    }
}

impl DatabaseConfig {
    /// Create an in-memory database configuration
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
        }
    }
}

/// Configuration of a single content store.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct BlobStoreConfig {
    /// Storage DSN (file://, memory://, s3://)
    pub dsn: String,
    /// Maximum total bytes before the store is reported as violating its quota
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<u64>,
    /// Maximum number of blobs before the store is reported as violating its quota
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_blob_count: Option<u64>,
}

/// A repository whose components live in one content store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RepositoryConfig {
    pub name: String,
    pub format: String,
    pub blob_store: String,
    #[serde(default)]
    pub cleanup_policies: Vec<String>,
}

/// What a cleanup policy does with the components it matches.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    /// Delete matching components
    #[default]
    Delete,
    /// Only report how many components would be deleted
    Preview,
}

/// Administrator-defined cleanup policy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CleanupPolicyConfig {
    pub name: String,
    /// Repository format this policy applies to, `*` for all formats
    #[serde(default = "default_policy_format")]
    pub format: String,
    #[serde(default)]
    pub mode: CleanupMode,
    #[serde(default)]
    pub criteria: HashMap<String, String>,
}

fn default_policy_format() -> String {
    "*".to_string()
}

impl CleanupPolicyConfig {
    /// Whether this policy may run against a repository of the given format.
    pub fn applies_to(&self, format: &str) -> bool {
        self.format == "*" || self.format.eq_ignore_ascii_case(format)
    }
}

/// Reclaimer settings.
///
/// Env: BLOBKEEPER__COMPACTOR__RECLAIM__*
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReclaimConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between reclaim passes
    #[serde(with = "humantime_serde", default = "default_reclaim_interval")]
    pub interval: Duration,
    /// Ledger entries fetched per batch
    #[serde(default = "default_reclaim_batch_size")]
    pub batch_size: usize,
    /// Pause between two batches of one pass
    #[serde(with = "humantime_serde", default = "default_batch_pause")]
    pub batch_pause: Duration,
    /// Log decisions without deleting content or ledger entries
    #[serde(default)]
    pub dry_run: bool,
    /// Re-create ledger entries for soft-deleted blobs before the first pass
    #[serde(default)]
    pub rebuild_ledger_on_start: bool,
}

fn default_true() -> bool {
    true
}

fn default_reclaim_interval() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_reclaim_batch_size() -> usize {
    1000
}

fn default_batch_pause() -> Duration {
    Duration::from_millis(100)
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_reclaim_interval(),
            batch_size: default_reclaim_batch_size(),
            batch_pause: default_batch_pause(),
            dry_run: false,
            rebuild_ledger_on_start: false,
        }
    }
}

/// Cleanup policy runner settings.
///
/// Env: BLOBKEEPER__COMPACTOR__CLEANUP__*
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub interval: Duration,
    /// Items removed per bulk deletion batch
    #[serde(default = "default_cleanup_batch_size")]
    pub batch_size: usize,
    /// Attempts per repository run before giving up
    #[serde(default = "default_cleanup_attempts")]
    pub max_attempts: u32,
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_cleanup_batch_size() -> usize {
    500
}

fn default_cleanup_attempts() -> u32 {
    3
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_cleanup_interval(),
            batch_size: default_cleanup_batch_size(),
            max_attempts: default_cleanup_attempts(),
        }
    }
}

/// Periodic quota health check settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(with = "humantime_serde", default = "default_quota_interval")]
    pub interval: Duration,
}

fn default_quota_interval() -> Duration {
    Duration::from_secs(300)
}

impl Default for QuotaCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_quota_interval(),
        }
    }
}

/// Bounded retry around metadata store calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompactorConfig {
    /// Run the background service
    ///
    /// Env: BLOBKEEPER__COMPACTOR__ENABLED
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub reclaim: ReclaimConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub quota: QuotaCheckConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reclaim: ReclaimConfig::default(),
            cleanup: CleanupConfig::default(),
            quota: QuotaCheckConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    /// Database holding the deletion ledger and metadata tables
    pub database: DatabaseConfig,
    /// Named content stores
    #[serde(default)]
    pub stores: HashMap<String, BlobStoreConfig>,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
    #[serde(default)]
    pub cleanup_policies: Vec<CleanupPolicyConfig>,
    #[serde(default)]
    pub compactor: CompactorConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            stores: HashMap::new(),
            repositories: Vec::new(),
            cleanup_policies: Vec::new(),
            compactor: CompactorConfig::default(),
        }
    }
}

impl Configuration {
    /// Content stores to open, falling back to one in-memory store when none
    /// is configured.
    pub fn effective_stores(&self) -> HashMap<String, BlobStoreConfig> {
        if self.stores.is_empty() {
            let mut stores = HashMap::new();
            stores.insert(
                DEFAULT_STORE_NAME.to_string(),
                BlobStoreConfig {
                    dsn: "memory://".to_string(),
                    ..Default::default()
                },
            );
            stores
        } else {
            self.stores.clone()
        }
    }

    pub fn policy(&self, name: &str) -> Option<&CleanupPolicyConfig> {
        self.cleanup_policies.iter().find(|p| p.name == name)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
    }

    pub fn load() -> Result<Self, ConfigError> {
        let config = Self::figment()
            .merge(Toml::file("blobkeeper.toml"))
            .merge(Env::prefixed("BLOBKEEPER__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::figment()
            .merge(Toml::file(path))
            .merge(Env::prefixed("BLOBKEEPER__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.database.dsn.is_empty() {
            return invalid("database DSN cannot be empty".to_string());
        }

        for (name, store) in &self.stores {
            if store.dsn.is_empty() {
                return invalid(format!("store '{name}' has an empty DSN"));
            }
        }

        for repository in &self.repositories {
            if !self.effective_stores().contains_key(&repository.blob_store) {
                return invalid(format!(
                    "repository '{}' references unknown blob store '{}'",
                    repository.name, repository.blob_store
                ));
            }
        }

        for policy in &self.cleanup_policies {
            if let Err(e) = CleanupCriteria::from_map(&policy.criteria) {
                return invalid(format!("cleanup policy '{}': {e}", policy.name));
            }
        }

        let compactor = &self.compactor;
        if compactor.reclaim.batch_size == 0 {
            return invalid("compactor.reclaim.batch_size must be positive".to_string());
        }
        if compactor.reclaim.interval.is_zero() {
            return invalid("compactor.reclaim.interval must be positive".to_string());
        }
        if compactor.cleanup.batch_size == 0 {
            return invalid("compactor.cleanup.batch_size must be positive".to_string());
        }
        if compactor.cleanup.max_attempts == 0 {
            return invalid("compactor.cleanup.max_attempts must be positive".to_string());
        }
        if compactor.cleanup.interval.is_zero() || compactor.quota.interval.is_zero() {
            return invalid("compactor intervals must be positive".to_string());
        }
        if compactor.retry.max_attempts == 0 {
            return invalid("compactor.retry.max_attempts must be positive".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = Configuration::default();

        assert_eq!(config.database.dsn, "sqlite://.data/blobkeeper.db");
        assert!(config.compactor.enabled);
        assert_eq!(config.compactor.reclaim.batch_size, 1000);
        assert_eq!(config.compactor.cleanup.batch_size, 500);
        assert_eq!(config.compactor.cleanup.max_attempts, 3);
        assert!(!config.compactor.reclaim.dry_run);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_policy_criteria_are_rejected() {
        let mut config = Configuration::default();
        config.cleanup_policies.push(CleanupPolicyConfig {
            name: "broken".to_string(),
            format: "*".to_string(),
            mode: CleanupMode::Delete,
            criteria: HashMap::from([("lastBlobUpdated".to_string(), "soon".to_string())]),
        });

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_configless_operation_uses_memory_store() {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .extract::<Configuration>()
            .unwrap();

        let stores = config.effective_stores();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[DEFAULT_STORE_NAME].dsn, "memory://");
    }

    #[test]
    fn test_toml_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "blobkeeper.toml",
                r#"
                [database]
                dsn = "sqlite::memory:"

                [stores.primary]
                dsn = "file:///tmp/blobs"
                max_size_bytes = 1000000

                [[repositories]]
                name = "maven-releases"
                format = "maven2"
                blob_store = "primary"
                cleanup_policies = ["old-snapshots"]

                [[cleanup_policies]]
                name = "old-snapshots"
                format = "maven2"
                criteria = { lastBlobUpdated = "30" }

                [compactor.reclaim]
                batch_size = 250
                interval = "1h"
                "#,
            )?;
            jail.set_env("BLOBKEEPER__COMPACTOR__RECLAIM__DRY_RUN", "true");

            let config = Configuration::load().map_err(|e| e.to_string())?;
            assert_eq!(config.database.dsn, "sqlite::memory:");
            assert_eq!(config.stores["primary"].max_size_bytes, Some(1_000_000));
            assert_eq!(config.stores["primary"].max_blob_count, None);
            assert_eq!(config.repositories[0].cleanup_policies, vec!["old-snapshots"]);
            let policy = config.policy("old-snapshots").unwrap();
            assert_eq!(policy.mode, CleanupMode::Delete);
            assert_eq!(policy.criteria["lastBlobUpdated"], "30");
            assert_eq!(config.compactor.reclaim.batch_size, 250);
            assert_eq!(config.compactor.reclaim.interval, Duration::from_secs(3600));
            assert!(config.compactor.reclaim.dry_run);
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_repository_with_unknown_store_is_invalid() {
        let mut config = Configuration::default();
        config.repositories.push(RepositoryConfig {
            name: "npm-proxy".to_string(),
            format: "npm".to_string(),
            blob_store: "missing".to_string(),
            cleanup_policies: vec![],
        });

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown blob store"));
    }

    #[test]
    fn test_zero_batch_size_is_invalid() {
        let mut config = Configuration::default();
        config.compactor.cleanup.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_format_matching() {
        let policy = CleanupPolicyConfig {
            name: "all".to_string(),
            format: "*".to_string(),
            mode: CleanupMode::Preview,
            criteria: HashMap::new(),
        };
        assert!(policy.applies_to("npm"));

        let maven_only = CleanupPolicyConfig {
            format: "maven2".to_string(),
            ..policy
        };
        assert!(maven_only.applies_to("MAVEN2"));
        assert!(!maven_only.applies_to("npm"));
    }
}
