//! Wrappers that fail selected operations on demand.
//!
//! Every switch can be flipped while a test runs, so one test can observe a
//! failing pass and then a healthy one against the same state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::blob::{
    Blob, BlobHeaders, BlobId, BlobStoreError, BlobStoreResult, BlobStoreStats, ContentStore,
    SoftDeletedBlob,
};
use crate::ledger::{
    DeletionLedger, DeletionRecord, InMemoryDeletionLedger, LedgerCursor, LedgerError,
    LedgerResult,
};

fn storage_error(operation: &str) -> BlobStoreError {
    BlobStoreError::Storage(object_store::Error::Generic {
        store: "faulty",
        source: format!("injected {operation} failure").into(),
    })
}

fn ledger_error() -> LedgerError {
    LedgerError::Database(sqlx::Error::PoolClosed)
}

/// Content store delegating to `inner` unless a fault is switched on.
pub struct FaultyContentStore {
    inner: Arc<dyn ContentStore>,
    fail_soft_delete: AtomicBool,
    fail_hard_delete: AtomicBool,
    stale_exists: AtomicBool,
}

impl FaultyContentStore {
    pub fn new(inner: Arc<dyn ContentStore>) -> Self {
        Self {
            inner,
            fail_soft_delete: AtomicBool::new(false),
            fail_hard_delete: AtomicBool::new(false),
            stale_exists: AtomicBool::new(false),
        }
    }

    pub fn fail_soft_delete(&self, fail: bool) {
        self.fail_soft_delete.store(fail, Ordering::SeqCst);
    }

    /// Make `hard_delete` return a transient storage error.
    pub fn fail_hard_delete(&self, fail: bool) {
        self.fail_hard_delete.store(fail, Ordering::SeqCst);
    }

    /// Make `exists` report every blob as deleted, as a read that raced an
    /// undelete would.
    pub fn stale_exists(&self, stale: bool) {
        self.stale_exists.store(stale, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentStore for FaultyContentStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, content: Bytes, headers: BlobHeaders) -> BlobStoreResult<BlobId> {
        self.inner.put(content, headers).await
    }

    async fn get(&self, id: &BlobId) -> BlobStoreResult<Blob> {
        self.inner.get(id).await
    }

    async fn get_including_deleted(&self, id: &BlobId) -> BlobStoreResult<Blob> {
        self.inner.get_including_deleted(id).await
    }

    async fn exists(&self, id: &BlobId) -> BlobStoreResult<bool> {
        if self.stale_exists.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.exists(id).await
    }

    async fn soft_delete(&self, id: &BlobId, reason: &str) -> BlobStoreResult<bool> {
        if self.fail_soft_delete.load(Ordering::SeqCst) {
            return Err(storage_error("soft delete"));
        }
        self.inner.soft_delete(id, reason).await
    }

    async fn undelete(&self, id: &BlobId) -> BlobStoreResult<bool> {
        self.inner.undelete(id).await
    }

    async fn hard_delete(&self, id: &BlobId) -> BlobStoreResult<bool> {
        if self.fail_hard_delete.load(Ordering::SeqCst) {
            return Err(storage_error("hard delete"));
        }
        self.inner.hard_delete(id).await
    }

    async fn soft_deleted(&self) -> BlobStoreResult<Vec<SoftDeletedBlob>> {
        self.inner.soft_deleted().await
    }

    async fn stats(&self) -> BlobStoreResult<BlobStoreStats> {
        self.inner.stats().await
    }
}

/// In-memory ledger whose `record`, `drain_after` and `remove` can be made
/// to fail.
#[derive(Debug, Default)]
pub struct FaultyDeletionLedger {
    inner: InMemoryDeletionLedger,
    fail_record: AtomicBool,
    fail_drain: AtomicBool,
    fail_remove: AtomicBool,
}

impl FaultyDeletionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_record(&self, fail: bool) {
        self.fail_record.store(fail, Ordering::SeqCst);
    }

    pub fn fail_drain(&self, fail: bool) {
        self.fail_drain.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeletionLedger for FaultyDeletionLedger {
    async fn record(
        &self,
        blob_id: &BlobId,
        store_name: &str,
        blob_name: &str,
    ) -> LedgerResult<DeletionRecord> {
        if self.fail_record.load(Ordering::SeqCst) {
            return Err(ledger_error());
        }
        self.inner.record(blob_id, store_name, blob_name).await
    }

    async fn drain_after(
        &self,
        store_name: &str,
        after: LedgerCursor,
        marked_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> LedgerResult<Vec<DeletionRecord>> {
        if self.fail_drain.load(Ordering::SeqCst) {
            return Err(ledger_error());
        }
        self.inner
            .drain_after(store_name, after, marked_before, limit)
            .await
    }

    async fn remove(&self, record_id: Uuid) -> LedgerResult<bool> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(ledger_error());
        }
        self.inner.remove(record_id).await
    }

    async fn purge(&self, store_name: &str) -> LedgerResult<u64> {
        self.inner.purge(store_name).await
    }

    async fn count(&self, store_name: &str) -> LedgerResult<u64> {
        self.inner.count(store_name).await
    }

    async fn contains(&self, store_name: &str, blob_id: &BlobId) -> LedgerResult<bool> {
        self.inner.contains(store_name, blob_id).await
    }
}
