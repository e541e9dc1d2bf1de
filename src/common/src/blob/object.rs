use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};

use super::{
    Blob, BlobAttributes, BlobHeaders, BlobId, BlobStoreError, BlobStoreResult, BlobStoreStats,
    ContentStore, SoftDeletedBlob,
};

const CONTENT_DIR: &str = "content";
const BYTES_SUFFIX: &str = ".bytes";
const ATTRIBUTES_SUFFIX: &str = ".properties";

/// Content store on top of any `object_store` backend.
///
/// Layout: `content/<shard>/<blob-id>.bytes` holds the payload and
/// `content/<shard>/<blob-id>.properties` holds the JSON encoded
/// [`BlobAttributes`]. The shard is the first two characters of the id.
pub struct ObjectContentStore {
    name: String,
    object_store: Arc<dyn ObjectStore>,
    stats: Mutex<BlobStoreStats>,
    // Serialises attribute read-modify-write cycles
    mutation_lock: tokio::sync::Mutex<()>,
}

fn shard(id: &BlobId) -> &str {
    let s = id.as_str();
    s.get(..2).unwrap_or(s)
}

fn content_path(id: &BlobId) -> ObjectPath {
    ObjectPath::from(format!("{CONTENT_DIR}/{}/{id}{BYTES_SUFFIX}", shard(id)))
}

fn attributes_path(id: &BlobId) -> ObjectPath {
    ObjectPath::from(format!("{CONTENT_DIR}/{}/{id}{ATTRIBUTES_SUFFIX}", shard(id)))
}

fn is_not_found(error: &object_store::Error) -> bool {
    matches!(error, object_store::Error::NotFound { .. })
}

impl ObjectContentStore {
    /// Open a store, recovering usage statistics from the attribute files
    /// already present in the backend.
    pub async fn open(
        name: impl Into<String>,
        object_store: Arc<dyn ObjectStore>,
    ) -> BlobStoreResult<Self> {
        let store = Self {
            name: name.into(),
            object_store,
            stats: Mutex::new(BlobStoreStats::default()),
            mutation_lock: tokio::sync::Mutex::new(()),
        };

        let mut stats = BlobStoreStats::default();
        for (_, attributes) in store.scan_attributes().await? {
            stats.total_bytes += attributes.size;
            stats.blob_count += 1;
        }
        *store.lock_stats() = stats;

        log::info!(
            "Opened blob store '{}' with {} blobs ({} bytes)",
            store.name,
            stats.blob_count,
            stats.total_bytes
        );

        Ok(store)
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, BlobStoreStats> {
        // Counters stay consistent even if a holder panicked
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn scan_attributes(&self) -> BlobStoreResult<Vec<(BlobId, BlobAttributes)>> {
        let prefix = ObjectPath::from(CONTENT_DIR);
        let objects: Vec<_> = self.object_store.list(Some(&prefix)).try_collect().await?;

        let mut found = Vec::new();
        for meta in objects {
            let Some(file_name) = meta.location.filename() else {
                continue;
            };
            let Some(raw_id) = file_name.strip_suffix(ATTRIBUTES_SUFFIX) else {
                continue;
            };
            let id = match raw_id.parse::<BlobId>() {
                Ok(id) => id,
                Err(_) => {
                    log::warn!(
                        "Ignoring unexpected file {} in blob store '{}'",
                        meta.location,
                        self.name
                    );
                    continue;
                }
            };
            if let Some(attributes) = self.read_attributes(&id).await? {
                found.push((id, attributes));
            }
        }
        Ok(found)
    }

    async fn read_attributes(&self, id: &BlobId) -> BlobStoreResult<Option<BlobAttributes>> {
        let bytes = match self.object_store.get(&attributes_path(id)).await {
            Ok(result) => result.bytes().await?,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| BlobStoreError::CorruptAttributes {
                blob_id: id.clone(),
                source,
            })
    }

    async fn write_attributes(
        &self,
        id: &BlobId,
        attributes: &BlobAttributes,
    ) -> BlobStoreResult<()> {
        let json = serde_json::to_vec_pretty(attributes).map_err(|source| {
            BlobStoreError::CorruptAttributes {
                blob_id: id.clone(),
                source,
            }
        })?;
        self.object_store
            .put(&attributes_path(id), PutPayload::from(json))
            .await?;
        Ok(())
    }

    async fn delete_ignoring_missing(&self, path: &ObjectPath) -> BlobStoreResult<()> {
        match self.object_store.delete(path).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ContentStore for ObjectContentStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, content: Bytes, headers: BlobHeaders) -> BlobStoreResult<BlobId> {
        headers.validate()?;

        let id = BlobId::generate();
        let attributes = BlobAttributes {
            headers,
            size: content.len() as u64,
            created_at: Utc::now(),
            deleted: false,
            deleted_reason: None,
            deleted_at: None,
        };

        // Bytes first: attributes make the blob visible
        self.object_store
            .put(&content_path(&id), PutPayload::from(content))
            .await?;
        self.write_attributes(&id, &attributes).await?;

        {
            let mut stats = self.lock_stats();
            stats.total_bytes += attributes.size;
            stats.blob_count += 1;
        }

        log::debug!(
            "Stored blob {} ({} bytes) in '{}' for {}",
            id,
            attributes.size,
            self.name,
            attributes.headers.blob_name
        );

        Ok(id)
    }

    async fn get(&self, id: &BlobId) -> BlobStoreResult<Blob> {
        let blob = self.get_including_deleted(id).await?;
        if blob.attributes.deleted {
            return Err(BlobStoreError::NotFound(id.clone()));
        }
        Ok(blob)
    }

    async fn get_including_deleted(&self, id: &BlobId) -> BlobStoreResult<Blob> {
        let attributes = self
            .read_attributes(id)
            .await?
            .ok_or_else(|| BlobStoreError::NotFound(id.clone()))?;

        let content = match self.object_store.get(&content_path(id)).await {
            Ok(result) => result.bytes().await?,
            Err(e) if is_not_found(&e) => return Err(BlobStoreError::NotFound(id.clone())),
            Err(e) => return Err(e.into()),
        };

        Ok(Blob {
            id: id.clone(),
            attributes,
            content,
        })
    }

    async fn exists(&self, id: &BlobId) -> BlobStoreResult<bool> {
        Ok(self
            .read_attributes(id)
            .await?
            .is_some_and(|attributes| !attributes.deleted))
    }

    async fn soft_delete(&self, id: &BlobId, reason: &str) -> BlobStoreResult<bool> {
        let _guard = self.mutation_lock.lock().await;

        let Some(mut attributes) = self.read_attributes(id).await? else {
            log::warn!("Attempt to soft delete unknown blob {} in '{}'", id, self.name);
            return Ok(false);
        };

        if attributes.deleted {
            log::debug!("Blob {} in '{}' is already soft deleted", id, self.name);
            return Ok(true);
        }

        attributes.deleted = true;
        attributes.deleted_reason = Some(reason.to_string());
        attributes.deleted_at = Some(Utc::now());
        self.write_attributes(id, &attributes).await?;

        log::debug!("Soft deleted blob {} in '{}': {}", id, self.name, reason);
        Ok(true)
    }

    async fn undelete(&self, id: &BlobId) -> BlobStoreResult<bool> {
        let _guard = self.mutation_lock.lock().await;

        let Some(mut attributes) = self.read_attributes(id).await? else {
            return Ok(false);
        };
        if !attributes.deleted {
            return Ok(false);
        }

        match self.object_store.head(&content_path(id)).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {
                log::warn!(
                    "Cannot undelete blob {} in '{}': content is missing",
                    id,
                    self.name
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        attributes.deleted = false;
        attributes.deleted_reason = None;
        attributes.deleted_at = None;
        self.write_attributes(id, &attributes).await?;

        log::info!("Undeleted blob {} in '{}'", id, self.name);
        Ok(true)
    }

    async fn hard_delete(&self, id: &BlobId) -> BlobStoreResult<bool> {
        let _guard = self.mutation_lock.lock().await;

        let attributes = self.read_attributes(id).await?;
        // An undelete may have landed since the caller last looked
        if attributes.as_ref().is_some_and(|a| !a.deleted) {
            return Err(BlobStoreError::NotDeleted(id.clone()));
        }
        let content = content_path(id);

        let content_existed = match self.object_store.head(&content).await {
            Ok(_) => true,
            Err(e) if is_not_found(&e) => false,
            Err(e) => return Err(e.into()),
        };

        if content_existed {
            self.delete_ignoring_missing(&content).await?;
        }
        self.delete_ignoring_missing(&attributes_path(id)).await?;

        if let Some(attributes) = attributes {
            let mut stats = self.lock_stats();
            stats.total_bytes = stats.total_bytes.saturating_sub(attributes.size);
            stats.blob_count = stats.blob_count.saturating_sub(1);
        }

        log::debug!(
            "Hard deleted blob {} in '{}' (content present: {})",
            id,
            self.name,
            content_existed
        );
        Ok(content_existed)
    }

    async fn soft_deleted(&self) -> BlobStoreResult<Vec<SoftDeletedBlob>> {
        Ok(self
            .scan_attributes()
            .await?
            .into_iter()
            .filter(|(_, attributes)| attributes.deleted)
            .map(|(id, attributes)| SoftDeletedBlob {
                id,
                blob_name: attributes.headers.blob_name,
            })
            .collect())
    }

    async fn stats(&self) -> BlobStoreResult<BlobStoreStats> {
        Ok(*self.lock_stats())
    }
}
