//! Content-addressed blob storage.
//!
//! A content store holds opaque byte payloads keyed by a [`BlobId`] that the
//! store assigns on `put`. Removal is two-phase: `soft_delete` hides a blob
//! from normal readers but leaves its bytes in place, and `hard_delete`
//! physically removes it. Only the reclaimer issues hard deletes, after it has
//! confirmed that no live metadata references the blob.

pub mod object;
pub mod registry;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use object::ObjectContentStore;
pub use registry::BlobStoreRegistry;

/// Store-assigned blob identifier. Immutable once assigned.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlobId {
    type Err = BlobStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(BlobStoreError::InvalidBlobId(s.to_string()))
        }
    }
}

/// Caller-supplied headers stored alongside the content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobHeaders {
    /// Repository that owns the blob
    pub repo_name: String,
    /// Human readable blob name, usually the asset path
    pub blob_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl BlobHeaders {
    pub fn new(repo_name: impl Into<String>, blob_name: impl Into<String>) -> Self {
        Self {
            repo_name: repo_name.into(),
            blob_name: blob_name.into(),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    fn validate(&self) -> Result<(), BlobStoreError> {
        if self.repo_name.is_empty() {
            return Err(BlobStoreError::MissingHeader("repo_name"));
        }
        if self.blob_name.is_empty() {
            return Err(BlobStoreError::MissingHeader("blob_name"));
        }
        Ok(())
    }
}

/// Persistent attributes of a blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlobAttributes {
    pub headers: BlobHeaders,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_reason: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Content plus attributes.
#[derive(Clone, Debug)]
pub struct Blob {
    pub id: BlobId,
    pub attributes: BlobAttributes,
    pub content: Bytes,
}

/// Usage statistics of one store. Soft-deleted blobs still count until they
/// are hard deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlobStoreStats {
    pub total_bytes: u64,
    pub blob_count: u64,
}

/// A soft-deleted blob awaiting reclamation.
#[derive(Clone, Debug, PartialEq)]
pub struct SoftDeletedBlob {
    pub id: BlobId,
    pub blob_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("Blob {0} not found")]
    NotFound(BlobId),
    #[error("Invalid blob id '{0}'")]
    InvalidBlobId(String),
    #[error("Blob {0} is not soft deleted")]
    NotDeleted(BlobId),
    #[error("Missing required header '{0}'")]
    MissingHeader(&'static str),
    #[error("Corrupt attributes for blob {blob_id}: {source}")]
    CorruptAttributes {
        blob_id: BlobId,
        #[source]
        source: serde_json::Error,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),
}

pub type BlobStoreResult<T> = Result<T, BlobStoreError>;

/// A named content store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store name, unique within the process.
    fn name(&self) -> &str;

    /// Write a new blob. The store assigns the identifier.
    async fn put(&self, content: Bytes, headers: BlobHeaders) -> BlobStoreResult<BlobId>;

    /// Read a live blob. Soft-deleted blobs are reported as `NotFound`.
    async fn get(&self, id: &BlobId) -> BlobStoreResult<Blob>;

    /// Read a blob whether or not it has been soft deleted.
    async fn get_including_deleted(&self, id: &BlobId) -> BlobStoreResult<Blob>;

    /// Whether the blob exists and is not soft deleted.
    async fn exists(&self, id: &BlobId) -> BlobStoreResult<bool>;

    /// Mark a blob logically deleted, keeping its bytes.
    ///
    /// Returns `true` when the blob exists and is soft deleted afterwards,
    /// including when it already was. Returns `false` when the blob is unknown.
    async fn soft_delete(&self, id: &BlobId, reason: &str) -> BlobStoreResult<bool>;

    /// Restore a soft-deleted blob whose bytes are still present.
    async fn undelete(&self, id: &BlobId) -> BlobStoreResult<bool>;

    /// Irreversibly remove a soft-deleted blob. Returns `false` when the
    /// content was already absent and [`BlobStoreError::NotDeleted`] when the
    /// blob is live. Reserved for the reclaimer.
    async fn hard_delete(&self, id: &BlobId) -> BlobStoreResult<bool>;

    /// All soft-deleted blobs currently held by the store.
    async fn soft_deleted(&self) -> BlobStoreResult<Vec<SoftDeletedBlob>>;

    async fn stats(&self) -> BlobStoreResult<BlobStoreStats>;
}
