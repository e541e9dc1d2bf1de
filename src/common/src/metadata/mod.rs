//! Repository metadata: components, their assets, and the blobs those assets
//! point at.
//!
//! The engine only needs three things from it: whether any live asset still
//! references a blob, which components a cleanup policy selects, and bulk
//! removal of components/assets.

pub mod memory;
pub mod sql;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::blob::BlobId;
use crate::retry::RetryableError;

pub use memory::InMemoryMetadataStore;
pub use sql::SqlMetadataStore;

/// Something a bulk deletion can remove.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemId {
    /// A component and every asset it owns
    Component(i64),
    Asset(i64),
}

/// The blob an asset points at.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub store_name: String,
    pub blob_id: BlobId,
    pub blob_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Component {
    pub id: i64,
    pub repository: String,
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Asset {
    pub id: i64,
    pub component_id: Option<i64>,
    pub repository: String,
    pub path: String,
    pub blob: BlobRef,
    pub blob_updated: DateTime<Utc>,
    pub last_downloaded: Option<DateTime<Utc>>,
}

/// Input for creating an asset.
#[derive(Clone, Debug)]
pub struct NewAsset {
    pub component_id: Option<i64>,
    pub repository: String,
    pub path: String,
    pub blob: BlobRef,
    pub blob_updated: DateTime<Utc>,
    pub last_downloaded: Option<DateTime<Utc>>,
}

/// What a `delete_items` call removed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeletedItems {
    pub components: u64,
    pub assets: u64,
    /// Blobs of the removed assets, each listed once
    pub blobs: Vec<BlobRef>,
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),
    #[error("Concurrent modification: {0}")]
    Conflict(String),
    #[error("Metadata query failed: {0}")]
    Query(String),
}

impl RetryableError for MetadataError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetadataError::Unavailable(_) | MetadataError::Conflict(_)
        )
    }
}

impl From<sqlx::Error> for MetadataError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => MetadataError::Unavailable(e.to_string()),
            sqlx::Error::Database(db) => {
                let busy = db.code().is_some_and(|code| {
                    // SQLITE_BUSY, SQLITE_LOCKED, serialization_failure, deadlock_detected
                    matches!(code.as_ref(), "5" | "6" | "40001" | "40P01")
                });
                if busy {
                    MetadataError::Conflict(e.to_string())
                } else {
                    MetadataError::Query(e.to_string())
                }
            }
            _ => MetadataError::Query(e.to_string()),
        }
    }
}

pub type MetadataResult<T> = Result<T, MetadataError>;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CriteriaError {
    #[error("Unknown cleanup criterion '{0}'")]
    UnknownKey(String),
    #[error("Criterion '{key}' expects a whole number of days, got '{value}'")]
    InvalidDays { key: String, value: String },
    #[error("Invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },
}

pub const LAST_BLOB_UPDATED: &str = "lastBlobUpdated";
pub const LAST_DOWNLOADED: &str = "lastDownloaded";
pub const REGEX: &str = "regex";

/// Parsed cleanup policy criteria. All configured criteria must match.
#[derive(Clone, Debug, Default)]
pub struct CleanupCriteria {
    /// Newest blob of the component is older than this
    pub last_blob_updated: Option<Duration>,
    /// Component not downloaded within this window
    pub last_downloaded: Option<Duration>,
    /// Some asset path matches
    pub regex: Option<Regex>,
}

impl CleanupCriteria {
    pub fn from_map(criteria: &HashMap<String, String>) -> Result<Self, CriteriaError> {
        let mut parsed = Self::default();
        for (key, value) in criteria {
            match key.as_str() {
                LAST_BLOB_UPDATED => parsed.last_blob_updated = Some(parse_days(key, value)?),
                LAST_DOWNLOADED => parsed.last_downloaded = Some(parse_days(key, value)?),
                REGEX => {
                    let regex = Regex::new(value).map_err(|e| CriteriaError::InvalidRegex {
                        pattern: value.clone(),
                        message: e.to_string(),
                    })?;
                    parsed.regex = Some(regex);
                }
                other => return Err(CriteriaError::UnknownKey(other.to_string())),
            }
        }
        Ok(parsed)
    }

    /// No criteria at all. Such a policy would select everything.
    pub fn is_empty(&self) -> bool {
        self.last_blob_updated.is_none() && self.last_downloaded.is_none() && self.regex.is_none()
    }

    /// Whether a component with these assets is selected at `now`.
    /// Components without assets are never selected.
    pub fn matches(&self, assets: &[&Asset], now: DateTime<Utc>) -> bool {
        if assets.is_empty() || self.is_empty() {
            return false;
        }

        let newest_blob = assets.iter().map(|a| a.blob_updated).max();

        // A cutoff before the representable range is never reached
        if let (Some(age), Some(newest)) = (self.last_blob_updated, newest_blob)
            && now.checked_sub_signed(age).is_none_or(|cutoff| newest > cutoff)
        {
            return false;
        }

        if let Some(window) = self.last_downloaded {
            // Never-downloaded components age from their newest blob
            let last_used = assets
                .iter()
                .map(|a| a.last_downloaded.unwrap_or(a.blob_updated))
                .max();
            let Some(cutoff) = now.checked_sub_signed(window) else {
                return false;
            };
            if last_used.is_some_and(|t| t > cutoff) {
                return false;
            }
        }

        if let Some(regex) = &self.regex
            && !assets.iter().any(|a| regex.is_match(&a.path))
        {
            return false;
        }

        true
    }
}

fn parse_days(key: &str, value: &str) -> Result<Duration, CriteriaError> {
    value
        .trim()
        .parse::<u32>()
        .map(|days| Duration::days(i64::from(days)))
        .map_err(|_| CriteriaError::InvalidDays {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// Group assets under the components they belong to and keep the components
/// the criteria select. Shared by every store implementation.
pub(crate) fn select_components<'a>(
    components: impl IntoIterator<Item = &'a Component>,
    assets: impl IntoIterator<Item = &'a Asset>,
    criteria: &CleanupCriteria,
    now: DateTime<Utc>,
) -> Vec<ItemId> {
    let mut by_component: HashMap<i64, Vec<&Asset>> = HashMap::new();
    for asset in assets {
        if let Some(component_id) = asset.component_id {
            by_component.entry(component_id).or_default().push(asset);
        }
    }

    let mut selected: Vec<ItemId> = components
        .into_iter()
        .filter(|c| {
            by_component
                .get(&c.id)
                .is_some_and(|assets| criteria.matches(assets, now))
        })
        .map(|c| ItemId::Component(c.id))
        .collect();
    selected.sort();
    selected
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Whether any live asset references this blob.
    async fn is_blob_referenced(&self, store_name: &str, blob_id: &BlobId)
    -> MetadataResult<bool>;

    /// Components of `repository` selected by `criteria`, in id order.
    async fn find_components(
        &self,
        repository: &str,
        criteria: &CleanupCriteria,
    ) -> MetadataResult<Vec<ItemId>>;

    /// Remove the given items of `repository` in one commit. Items that do
    /// not exist (or belong elsewhere) are skipped.
    async fn delete_items(
        &self,
        repository: &str,
        items: &[ItemId],
    ) -> MetadataResult<DeletedItems>;
}
