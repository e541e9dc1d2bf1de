use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, query};
use uuid::Uuid;

use super::{
    DeletionLedger, DeletionRecord, LedgerCursor, LedgerError, LedgerResult, ledger_now,
};
use crate::blob::BlobId;
use crate::database::{Database, numbered};

const CREATE_LEDGER_SQLITE: &str = r#"
CREATE TABLE IF NOT EXISTS deletion_ledger (
    record_id TEXT PRIMARY KEY,
    blob_id TEXT NOT NULL,
    blob_store_name TEXT NOT NULL,
    blob_name TEXT NOT NULL,
    marked_at INTEGER NOT NULL
)"#;

const CREATE_LEDGER_POSTGRES: &str = r#"
CREATE TABLE IF NOT EXISTS deletion_ledger (
    record_id TEXT PRIMARY KEY,
    blob_id TEXT NOT NULL,
    blob_store_name TEXT NOT NULL,
    blob_name TEXT NOT NULL,
    marked_at BIGINT NOT NULL
)"#;

const CREATE_BLOB_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_deletion_ledger_blob ON deletion_ledger (blob_store_name, blob_id)";
const CREATE_DRAIN_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_deletion_ledger_drain ON deletion_ledger (blob_store_name, marked_at, record_id)";

/// Pre-record_id schema, keyed by blob_id alone
const LEGACY_TABLE: &str = "deleted_blobs";

const INSERT: &str = "INSERT INTO deletion_ledger (record_id, blob_id, blob_store_name, blob_name, marked_at) VALUES (?, ?, ?, ?, ?)";
const DRAIN: &str = r#"
SELECT record_id, blob_id, blob_store_name, blob_name, marked_at
FROM deletion_ledger
WHERE blob_store_name = ?
  AND (marked_at > ? OR (marked_at = ? AND record_id > ?))
  AND marked_at <= ?
ORDER BY marked_at, record_id
LIMIT ?"#;
const REMOVE: &str = "DELETE FROM deletion_ledger WHERE record_id = ?";
const PURGE: &str = "DELETE FROM deletion_ledger WHERE blob_store_name = ?";
const COUNT: &str = "SELECT COUNT(*) AS n FROM deletion_ledger WHERE blob_store_name = ?";
const CONTAINS: &str =
    "SELECT COUNT(*) AS n FROM deletion_ledger WHERE blob_store_name = ? AND blob_id = ?";

/// Deletion ledger persisted in the engine database.
#[derive(Clone, Debug)]
pub struct SqlDeletionLedger {
    db: Database,
}

impl SqlDeletionLedger {
    /// Create the schema if needed and migrate a legacy `deleted_blobs` table.
    ///
    /// A failed migration is returned as [`LedgerError::Migration`]; the
    /// engine must not start on top of a half-migrated ledger.
    pub async fn new(db: Database) -> LedgerResult<Self> {
        let ledger = Self { db };
        ledger.init().await?;
        ledger.migrate_legacy().await?;
        Ok(ledger)
    }

    async fn init(&self) -> LedgerResult<()> {
        match &self.db {
            Database::Sqlite(pool) => {
                query(CREATE_LEDGER_SQLITE).execute(pool).await?;
                query(CREATE_BLOB_INDEX).execute(pool).await?;
                query(CREATE_DRAIN_INDEX).execute(pool).await?;
            }
            Database::Postgres(pool) => {
                query(CREATE_LEDGER_POSTGRES).execute(pool).await?;
                query(CREATE_BLOB_INDEX).execute(pool).await?;
                query(CREATE_DRAIN_INDEX).execute(pool).await?;
            }
        }
        Ok(())
    }

    async fn legacy_table_exists(&self) -> Result<bool, sqlx::Error> {
        let n: i64 = match &self.db {
            Database::Sqlite(pool) => {
                query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?")
                    .bind(LEGACY_TABLE)
                    .fetch_one(pool)
                    .await?
                    .try_get("n")?
            }
            Database::Postgres(pool) => {
                query("SELECT COUNT(*) AS n FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = $1")
                    .bind(LEGACY_TABLE)
                    .fetch_one(pool)
                    .await?
                    .try_get("n")?
            }
        };
        Ok(n > 0)
    }

    async fn migrate_legacy(&self) -> LedgerResult<()> {
        let exists = self
            .legacy_table_exists()
            .await
            .map_err(|e| LedgerError::Migration(format!("cannot inspect schema: {e}")))?;
        if !exists {
            return Ok(());
        }

        log::warn!(
            "Found legacy '{LEGACY_TABLE}' table keyed by blob_id, migrating to deletion_ledger"
        );

        let migrated = self
            .copy_legacy_rows()
            .await
            .map_err(|e| LedgerError::Migration(format!("cannot migrate '{LEGACY_TABLE}': {e}")))?;

        log::info!("Migrated {migrated} legacy ledger rows to deletion_ledger");
        Ok(())
    }

    /// Copy every legacy row under a fresh record_id and drop the legacy
    /// table, all in one transaction.
    async fn copy_legacy_rows(&self) -> Result<usize, sqlx::Error> {
        let select =
            format!("SELECT blob_id, blob_store_name, blob_name, deleted_at FROM {LEGACY_TABLE}");
        let drop = format!("DROP TABLE {LEGACY_TABLE}");

        let migrated = match &self.db {
            Database::Sqlite(pool) => {
                let mut tx = pool.begin().await?;
                let rows = query(&select).fetch_all(&mut *tx).await?;
                for row in &rows {
                    query(INSERT)
                        .bind(Uuid::new_v4().to_string())
                        .bind(row.try_get::<String, _>("blob_id")?)
                        .bind(row.try_get::<String, _>("blob_store_name")?)
                        .bind(row.try_get::<String, _>("blob_name")?)
                        .bind(row.try_get::<i64, _>("deleted_at")?)
                        .execute(&mut *tx)
                        .await?;
                }
                query(&drop).execute(&mut *tx).await?;
                tx.commit().await?;
                rows.len()
            }
            Database::Postgres(pool) => {
                let insert = numbered(INSERT);
                let mut tx = pool.begin().await?;
                let rows = query(&select).fetch_all(&mut *tx).await?;
                for row in &rows {
                    query(&insert)
                        .bind(Uuid::new_v4().to_string())
                        .bind(row.try_get::<String, _>("blob_id")?)
                        .bind(row.try_get::<String, _>("blob_store_name")?)
                        .bind(row.try_get::<String, _>("blob_name")?)
                        .bind(row.try_get::<i64, _>("deleted_at")?)
                        .execute(&mut *tx)
                        .await?;
                }
                query(&drop).execute(&mut *tx).await?;
                tx.commit().await?;
                rows.len()
            }
        };
        Ok(migrated)
    }
}

fn decode_record<'r, R>(row: &'r R) -> LedgerResult<DeletionRecord>
where
    R: Row,
    &'static str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    let record_id: String = row.try_get("record_id")?;
    let blob_id: String = row.try_get("blob_id")?;
    let marked_at: i64 = row.try_get("marked_at")?;

    Ok(DeletionRecord {
        record_id: Uuid::parse_str(&record_id)
            .map_err(|_| LedgerError::Decode(format!("invalid record_id '{record_id}'")))?,
        blob_id: blob_id
            .parse()
            .map_err(|_| LedgerError::Decode(format!("invalid blob_id '{blob_id}'")))?,
        store_name: row.try_get("blob_store_name")?,
        blob_name: row.try_get("blob_name")?,
        marked_at: DateTime::from_timestamp_millis(marked_at)
            .ok_or_else(|| LedgerError::Decode(format!("invalid marked_at {marked_at}")))?,
    })
}

#[async_trait]
impl DeletionLedger for SqlDeletionLedger {
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

        match &self.db {
            Database::Sqlite(pool) => {
                query(INSERT)
                    .bind(record.record_id.to_string())
                    .bind(record.blob_id.as_str())
                    .bind(&record.store_name)
                    .bind(&record.blob_name)
                    .bind(record.marked_at.timestamp_millis())
                    .execute(pool)
                    .await?;
            }
            Database::Postgres(pool) => {
                query(&numbered(INSERT))
                    .bind(record.record_id.to_string())
                    .bind(record.blob_id.as_str())
                    .bind(&record.store_name)
                    .bind(&record.blob_name)
                    .bind(record.marked_at.timestamp_millis())
                    .execute(pool)
                    .await?;
            }
        }

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
        let after_id = after.record_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        match &self.db {
            Database::Sqlite(pool) => {
                let rows = query(DRAIN)
                    .bind(store_name)
                    .bind(after.marked_at_ms)
                    .bind(after.marked_at_ms)
                    .bind(&after_id)
                    .bind(cutoff_ms)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?;
                rows.iter().map(decode_record).collect()
            }
            Database::Postgres(pool) => {
                let rows = query(&numbered(DRAIN))
                    .bind(store_name)
                    .bind(after.marked_at_ms)
                    .bind(after.marked_at_ms)
                    .bind(&after_id)
                    .bind(cutoff_ms)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?;
                rows.iter().map(decode_record).collect()
            }
        }
    }

    async fn remove(&self, record_id: Uuid) -> LedgerResult<bool> {
        let id = record_id.to_string();
        let affected = match &self.db {
            Database::Sqlite(pool) => query(REMOVE).bind(&id).execute(pool).await?.rows_affected(),
            Database::Postgres(pool) => query(&numbered(REMOVE))
                .bind(&id)
                .execute(pool)
                .await?
                .rows_affected(),
        };
        Ok(affected > 0)
    }

    async fn purge(&self, store_name: &str) -> LedgerResult<u64> {
        let affected = match &self.db {
            Database::Sqlite(pool) => query(PURGE)
                .bind(store_name)
                .execute(pool)
                .await?
                .rows_affected(),
            Database::Postgres(pool) => query(&numbered(PURGE))
                .bind(store_name)
                .execute(pool)
                .await?
                .rows_affected(),
        };
        log::warn!("Purged {affected} deletion ledger entries for blob store '{store_name}'");
        Ok(affected)
    }

    async fn count(&self, store_name: &str) -> LedgerResult<u64> {
        let n: i64 = match &self.db {
            Database::Sqlite(pool) => query(COUNT)
                .bind(store_name)
                .fetch_one(pool)
                .await?
                .try_get("n")?,
            Database::Postgres(pool) => query(&numbered(COUNT))
                .bind(store_name)
                .fetch_one(pool)
                .await?
                .try_get("n")?,
        };
        Ok(n.max(0) as u64)
    }

    async fn contains(&self, store_name: &str, blob_id: &BlobId) -> LedgerResult<bool> {
        let n: i64 = match &self.db {
            Database::Sqlite(pool) => query(CONTAINS)
                .bind(store_name)
                .bind(blob_id.as_str())
                .fetch_one(pool)
                .await?
                .try_get("n")?,
            Database::Postgres(pool) => query(&numbered(CONTAINS))
                .bind(store_name)
                .bind(blob_id.as_str())
                .fetch_one(pool)
                .await?
                .try_get("n")?,
        };
        Ok(n > 0)
    }
}
