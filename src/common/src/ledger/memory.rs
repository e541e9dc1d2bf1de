use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DeletionLedger, DeletionRecord, LedgerCursor, LedgerResult, ledger_now};
use crate::blob::BlobId;

/// Non-durable ledger for tests and config-less runs.
#[derive(Debug, Default)]
pub struct InMemoryDeletionLedger {
    // Keyed in drain order
    records: RwLock<BTreeMap<LedgerCursor, DeletionRecord>>,
}

impl InMemoryDeletionLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeletionLedger for InMemoryDeletionLedger {
    async fn record(
        &self,
        blob_id: &BlobId,
        store_name: &str,
        blob_name: &str,
    ) -> LedgerResult<DeletionRecord> {
        let record = DeletionRecord {
            record_id: Uuid::new_v4(),
            blob_id: blob_id.clone(),
            store_name: store_name.to_string(),
            blob_name: blob_name.to_string(),
            marked_at: ledger_now(),
        };
        self.records
            .write()
            .await
            .insert(record.cursor(), record.clone());
        Ok(record)
    }

    async fn drain_after(
        &self,
        store_name: &str,
        after: LedgerCursor,
        marked_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> LedgerResult<Vec<DeletionRecord>> {
        let cutoff_ms = marked_before.map_or(i64::MAX, |t| t.timestamp_millis());
        let records = self.records.read().await;
        Ok(records
            .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
            .map(|(_, record)| record)
            .filter(|record| record.store_name == store_name)
            .take_while(|record| record.marked_at.timestamp_millis() <= cutoff_ms)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove(&self, record_id: Uuid) -> LedgerResult<bool> {
        let mut records = self.records.write().await;
        let key = records
            .iter()
            .find(|(_, record)| record.record_id == record_id)
            .map(|(key, _)| *key);
        Ok(key.is_some_and(|key| records.remove(&key).is_some()))
    }

    async fn purge(&self, store_name: &str) -> LedgerResult<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.store_name != store_name);
        Ok((before - records.len()) as u64)
    }

    async fn count(&self, store_name: &str) -> LedgerResult<u64> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|record| record.store_name == store_name)
            .count() as u64)
    }

    async fn contains(&self, store_name: &str, blob_id: &BlobId) -> LedgerResult<bool> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .any(|record| record.store_name == store_name && &record.blob_id == blob_id))
    }
}
