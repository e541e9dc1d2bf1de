//! Deletion ledger: the durable record of blobs that were soft deleted and
//! are waiting for the reclaimer.
//!
//! Entries are keyed by `record_id`. The same `blob_id` may be recorded more
//! than once (a blob soft deleted again before reclamation ran), so `blob_id`
//! is indexed but never unique. Entries leave the ledger only through
//! [`DeletionLedger::remove`] after a confirmed hard delete, or through an
//! administrative [`DeletionLedger::purge`].

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::blob::BlobId;

pub use memory::InMemoryDeletionLedger;
pub use sql::SqlDeletionLedger;

/// A pending deletion.
#[derive(Clone, Debug, PartialEq)]
pub struct DeletionRecord {
    pub record_id: Uuid,
    pub blob_id: BlobId,
    pub store_name: String,
    pub blob_name: String,
    pub marked_at: DateTime<Utc>,
}

impl DeletionRecord {
    /// Position of this record in drain order.
    pub fn cursor(&self) -> LedgerCursor {
        LedgerCursor {
            marked_at_ms: self.marked_at.timestamp_millis(),
            record_id: self.record_id,
        }
    }
}

/// Keyset position in the `(marked_at, record_id)` drain order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LedgerCursor {
    pub marked_at_ms: i64,
    pub record_id: Uuid,
}

impl LedgerCursor {
    /// Position before every record.
    pub const START: LedgerCursor = LedgerCursor {
        marked_at_ms: i64::MIN,
        record_id: Uuid::nil(),
    };
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Ledger migration failed: {0}")]
    Migration(String),
    #[error("Corrupt ledger row: {0}")]
    Decode(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Current time truncated to the millisecond precision the ledger persists.
pub(crate) fn ledger_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[async_trait]
pub trait DeletionLedger: Send + Sync {
    /// Record a pending deletion and return the new entry.
    async fn record(
        &self,
        blob_id: &BlobId,
        store_name: &str,
        blob_name: &str,
    ) -> LedgerResult<DeletionRecord>;

    /// Up to `limit` entries of a store positioned strictly after `after`,
    /// ordered by `(marked_at, record_id)`. Entries marked later than
    /// `marked_before` are not returned. Entries are not removed.
    async fn drain_after(
        &self,
        store_name: &str,
        after: LedgerCursor,
        marked_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> LedgerResult<Vec<DeletionRecord>>;

    /// Oldest `limit` entries of a store.
    async fn drain(&self, store_name: &str, limit: usize) -> LedgerResult<Vec<DeletionRecord>> {
        self.drain_after(store_name, LedgerCursor::START, None, limit)
            .await
    }

    /// Remove one entry. Returns `false` if it was already gone.
    async fn remove(&self, record_id: Uuid) -> LedgerResult<bool>;

    /// Remove every entry of a store. Administrative only.
    async fn purge(&self, store_name: &str) -> LedgerResult<u64>;

    async fn count(&self, store_name: &str) -> LedgerResult<u64>;

    /// Whether any entry of the store refers to `blob_id`.
    async fn contains(&self, store_name: &str, blob_id: &BlobId) -> LedgerResult<bool>;
}
