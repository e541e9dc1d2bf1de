use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, query};

use super::{
    Asset, BlobRef, CleanupCriteria, Component, DeletedItems, ItemId, MetadataError,
    MetadataResult, MetadataStore, NewAsset, select_components,
};
use crate::blob::BlobId;
use crate::database::{Database, numbered};

const CREATE_COMPONENTS_SQLITE: &str = r#"
CREATE TABLE IF NOT EXISTS components (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL
)"#;

const CREATE_ASSETS_SQLITE: &str = r#"
CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    component_id INTEGER,
    repository TEXT NOT NULL,
    path TEXT NOT NULL,
    blob_store_name TEXT NOT NULL,
    blob_id TEXT NOT NULL,
    blob_name TEXT NOT NULL,
    blob_updated INTEGER NOT NULL,
    last_downloaded INTEGER
)"#;

const CREATE_COMPONENTS_POSTGRES: &str = r#"
CREATE TABLE IF NOT EXISTS components (
    id BIGSERIAL PRIMARY KEY,
    repository TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL
)"#;

const CREATE_ASSETS_POSTGRES: &str = r#"
CREATE TABLE IF NOT EXISTS assets (
    id BIGSERIAL PRIMARY KEY,
    component_id BIGINT,
    repository TEXT NOT NULL,
    path TEXT NOT NULL,
    blob_store_name TEXT NOT NULL,
    blob_id TEXT NOT NULL,
    blob_name TEXT NOT NULL,
    blob_updated BIGINT NOT NULL,
    last_downloaded BIGINT
)"#;

const CREATE_INDEXES: [&str; 3] = [
    "CREATE INDEX IF NOT EXISTS idx_assets_blob ON assets (blob_store_name, blob_id)",
    "CREATE INDEX IF NOT EXISTS idx_assets_component ON assets (component_id)",
    "CREATE INDEX IF NOT EXISTS idx_components_repository ON components (repository)",
];

const INSERT_COMPONENT: &str =
    "INSERT INTO components (repository, name, version) VALUES (?, ?, ?) RETURNING id";
const INSERT_ASSET: &str = r#"
INSERT INTO assets (component_id, repository, path, blob_store_name, blob_id, blob_name, blob_updated, last_downloaded)
VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id"#;
const BLOB_REFERENCED: &str =
    "SELECT COUNT(*) AS n FROM assets WHERE blob_store_name = ? AND blob_id = ?";
const SELECT_COMPONENTS: &str =
    "SELECT id, repository, name, version FROM components WHERE repository = ?";
const ASSET_COLUMNS: &str = "id, component_id, repository, path, blob_store_name, blob_id, blob_name, blob_updated, last_downloaded";

/// Statement texts in the placeholder style of one backend.
struct Statements {
    select_assets: String,
    component_owned: String,
    assets_of_component: String,
    asset_owned: String,
    delete_component_assets: String,
    delete_component: String,
    delete_asset: String,
}

impl Statements {
    fn new(rewrite: impl Fn(&str) -> String) -> Self {
        Self {
            select_assets: rewrite(&format!(
                "SELECT {ASSET_COLUMNS} FROM assets WHERE repository = ?"
            )),
            component_owned: rewrite(
                "SELECT COUNT(*) AS n FROM components WHERE id = ? AND repository = ?",
            ),
            assets_of_component: rewrite(&format!(
                "SELECT {ASSET_COLUMNS} FROM assets WHERE component_id = ?"
            )),
            asset_owned: rewrite(&format!(
                "SELECT {ASSET_COLUMNS} FROM assets WHERE id = ? AND repository = ?"
            )),
            delete_component_assets: rewrite("DELETE FROM assets WHERE component_id = ?"),
            delete_component: rewrite("DELETE FROM components WHERE id = ?"),
            delete_asset: rewrite("DELETE FROM assets WHERE id = ?"),
        }
    }
}

/// Component/asset metadata in the engine database.
#[derive(Clone, Debug)]
pub struct SqlMetadataStore {
    db: Database,
}

impl SqlMetadataStore {
    pub async fn new(db: Database) -> MetadataResult<Self> {
        let store = Self { db };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> MetadataResult<()> {
        match &self.db {
            Database::Sqlite(pool) => {
                query(CREATE_COMPONENTS_SQLITE).execute(pool).await?;
                query(CREATE_ASSETS_SQLITE).execute(pool).await?;
                for index in CREATE_INDEXES {
                    query(index).execute(pool).await?;
                }
            }
            Database::Postgres(pool) => {
                query(CREATE_COMPONENTS_POSTGRES).execute(pool).await?;
                query(CREATE_ASSETS_POSTGRES).execute(pool).await?;
                for index in CREATE_INDEXES {
                    query(index).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn create_component(
        &self,
        repository: &str,
        name: &str,
        version: &str,
    ) -> MetadataResult<i64> {
        let id: i64 = match &self.db {
            Database::Sqlite(pool) => query(INSERT_COMPONENT)
                .bind(repository)
                .bind(name)
                .bind(version)
                .fetch_one(pool)
                .await?
                .try_get("id")?,
            Database::Postgres(pool) => query(&numbered(INSERT_COMPONENT))
                .bind(repository)
                .bind(name)
                .bind(version)
                .fetch_one(pool)
                .await?
                .try_get("id")?,
        };
        Ok(id)
    }

    pub async fn create_asset(&self, asset: NewAsset) -> MetadataResult<i64> {
        let blob_updated = asset.blob_updated.timestamp_millis();
        let last_downloaded = asset.last_downloaded.map(|t| t.timestamp_millis());

        let id: i64 = match &self.db {
            Database::Sqlite(pool) => query(INSERT_ASSET)
                .bind(asset.component_id)
                .bind(&asset.repository)
                .bind(&asset.path)
                .bind(&asset.blob.store_name)
                .bind(asset.blob.blob_id.as_str())
                .bind(&asset.blob.blob_name)
                .bind(blob_updated)
                .bind(last_downloaded)
                .fetch_one(pool)
                .await?
                .try_get("id")?,
            Database::Postgres(pool) => query(&numbered(INSERT_ASSET))
                .bind(asset.component_id)
                .bind(&asset.repository)
                .bind(&asset.path)
                .bind(&asset.blob.store_name)
                .bind(asset.blob.blob_id.as_str())
                .bind(&asset.blob.blob_name)
                .bind(blob_updated)
                .bind(last_downloaded)
                .fetch_one(pool)
                .await?
                .try_get("id")?,
        };
        Ok(id)
    }
}

fn millis(value: i64) -> MetadataResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| MetadataError::Query(format!("invalid timestamp {value}")))
}

fn decode_component<'r, R>(row: &'r R) -> MetadataResult<Component>
where
    R: Row,
    &'static str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    Ok(Component {
        id: row.try_get("id")?,
        repository: row.try_get("repository")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
    })
}

fn decode_asset<'r, R>(row: &'r R) -> MetadataResult<Asset>
where
    R: Row,
    &'static str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<i64>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    let blob_id: String = row.try_get("blob_id")?;
    let last_downloaded: Option<i64> = row.try_get("last_downloaded")?;

    Ok(Asset {
        id: row.try_get("id")?,
        component_id: row.try_get("component_id")?,
        repository: row.try_get("repository")?,
        path: row.try_get("path")?,
        blob: BlobRef {
            store_name: row.try_get("blob_store_name")?,
            blob_id: blob_id
                .parse()
                .map_err(|_| MetadataError::Query(format!("invalid blob_id '{blob_id}'")))?,
            blob_name: row.try_get("blob_name")?,
        },
        blob_updated: millis(row.try_get("blob_updated")?)?,
        last_downloaded: last_downloaded.map(millis).transpose()?,
    })
}

/// Remember each removed asset's blob once.
fn collect_blobs(deleted: &mut DeletedItems, seen: &mut HashSet<BlobRef>, assets: Vec<Asset>) {
    for asset in assets {
        deleted.assets += 1;
        if seen.insert(asset.blob.clone()) {
            deleted.blobs.push(asset.blob);
        }
    }
}

/// Transactional body of `delete_items`, identical for both backends apart
/// from the pool type.
macro_rules! delete_items_in {
    ($pool:expr, $statements:expr, $repository:expr, $items:expr) => {{
        let statements = $statements;
        let mut deleted = DeletedItems::default();
        let mut seen = HashSet::new();
        let mut tx = $pool.begin().await?;

        for item in $items {
            match *item {
                ItemId::Component(id) => {
                    let owned: i64 = query(&statements.component_owned)
                        .bind(id)
                        .bind($repository)
                        .fetch_one(&mut *tx)
                        .await?
                        .try_get("n")?;
                    if owned == 0 {
                        continue;
                    }
                    let assets = query(&statements.assets_of_component)
                        .bind(id)
                        .fetch_all(&mut *tx)
                        .await?
                        .iter()
                        .map(decode_asset)
                        .collect::<MetadataResult<Vec<_>>>()?;
                    query(&statements.delete_component_assets)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    query(&statements.delete_component)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    deleted.components += 1;
                    collect_blobs(&mut deleted, &mut seen, assets);
                }
                ItemId::Asset(id) => {
                    let assets = query(&statements.asset_owned)
                        .bind(id)
                        .bind($repository)
                        .fetch_all(&mut *tx)
                        .await?
                        .iter()
                        .map(decode_asset)
                        .collect::<MetadataResult<Vec<_>>>()?;
                    if assets.is_empty() {
                        continue;
                    }
                    query(&statements.delete_asset)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    collect_blobs(&mut deleted, &mut seen, assets);
                }
            }
        }

        tx.commit().await?;
        deleted
    }};
}

#[async_trait]
impl MetadataStore for SqlMetadataStore {
    async fn is_blob_referenced(
        &self,
        store_name: &str,
        blob_id: &BlobId,
    ) -> MetadataResult<bool> {
        let n: i64 = match &self.db {
            Database::Sqlite(pool) => query(BLOB_REFERENCED)
                .bind(store_name)
                .bind(blob_id.as_str())
                .fetch_one(pool)
                .await?
                .try_get("n")?,
            Database::Postgres(pool) => query(&numbered(BLOB_REFERENCED))
                .bind(store_name)
                .bind(blob_id.as_str())
                .fetch_one(pool)
                .await?
                .try_get("n")?,
        };
        Ok(n > 0)
    }

    async fn find_components(
        &self,
        repository: &str,
        criteria: &CleanupCriteria,
    ) -> MetadataResult<Vec<ItemId>> {
        if criteria.is_empty() {
            return Ok(Vec::new());
        }

        let (components, assets) = match &self.db {
            Database::Sqlite(pool) => {
                let statements = Statements::new(str::to_string);
                let components = query(SELECT_COMPONENTS)
                    .bind(repository)
                    .fetch_all(pool)
                    .await?
                    .iter()
                    .map(decode_component)
                    .collect::<MetadataResult<Vec<_>>>()?;
                let assets = query(&statements.select_assets)
                    .bind(repository)
                    .fetch_all(pool)
                    .await?
                    .iter()
                    .map(decode_asset)
                    .collect::<MetadataResult<Vec<_>>>()?;
                (components, assets)
            }
            Database::Postgres(pool) => {
                let statements = Statements::new(numbered);
                let components = query(&numbered(SELECT_COMPONENTS))
                    .bind(repository)
                    .fetch_all(pool)
                    .await?
                    .iter()
                    .map(decode_component)
                    .collect::<MetadataResult<Vec<_>>>()?;
                let assets = query(&statements.select_assets)
                    .bind(repository)
                    .fetch_all(pool)
                    .await?
                    .iter()
                    .map(decode_asset)
                    .collect::<MetadataResult<Vec<_>>>()?;
                (components, assets)
            }
        };

        Ok(select_components(
            &components,
            &assets,
            criteria,
            Utc::now(),
        ))
    }

    async fn delete_items(
        &self,
        repository: &str,
        items: &[ItemId],
    ) -> MetadataResult<DeletedItems> {
        let deleted = match &self.db {
            Database::Sqlite(pool) => {
                delete_items_in!(pool, Statements::new(str::to_string), repository, items)
            }
            Database::Postgres(pool) => {
                delete_items_in!(pool, Statements::new(numbered), repository, items)
            }
        };
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract::{self, Fixture, asset};
    use super::*;

    async fn store() -> SqlMetadataStore {
        SqlMetadataStore::new(Database::in_memory().await.unwrap())
            .await
            .unwrap()
    }

    async fn fixture(store: &SqlMetadataStore) -> Fixture {
        let old = store.create_component("maven", "old", "1.0").await.unwrap();
        store
            .create_asset(asset(old, "maven", "com/acme/old/1.0/old.jar", "old-jar", 60))
            .await
            .unwrap();
        store
            .create_asset(asset(old, "maven", "com/acme/old/1.0/old.sha1", "shared", 60))
            .await
            .unwrap();

        let fresh = store.create_component("maven", "fresh", "2.0").await.unwrap();
        let fresh_asset = store
            .create_asset(asset(fresh, "maven", "com/acme/fresh/2.0/fresh.pom", "shared", 1))
            .await
            .unwrap();

        let npm = store.create_component("npm", "left-pad", "1.0.0").await.unwrap();
        let npm_asset = store
            .create_asset(asset(npm, "npm", "left-pad/-/left-pad-1.0.0.tgz", "npm-blob", 90))
            .await
            .unwrap();

        Fixture {
            old_component: old,
            fresh_component: fresh,
            other_repo_component: npm,
            fresh_asset,
            npm_asset,
            shared_blob: "shared".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_find_components_applies_criteria() {
        let store = store().await;
        let f = fixture(&store).await;
        contract::find_components_applies_criteria(&store, &f).await;
    }

    #[tokio::test]
    async fn test_shared_blob_stays_referenced() {
        let store = store().await;
        let f = fixture(&store).await;
        contract::shared_blob_stays_referenced(&store, &f).await;
    }

    #[tokio::test]
    async fn test_delete_skips_foreign_and_missing_items() {
        let store = store().await;
        let f = fixture(&store).await;
        contract::delete_skips_foreign_and_missing_items(&store, &f).await;
    }

    #[tokio::test]
    async fn test_asset_deletion_leaves_component() {
        let store = store().await;
        let f = fixture(&store).await;

        let deleted = store
            .delete_items("maven", &[ItemId::Asset(f.fresh_asset)])
            .await
            .unwrap();
        assert_eq!(deleted.components, 0);
        assert_eq!(deleted.assets, 1);

        // Shared blob is still held by the old component
        assert!(store.is_blob_referenced("default", &f.shared_blob).await.unwrap());
    }

    #[tokio::test]
    async fn test_timestamps_round_trip_through_rows() {
        let store = store().await;
        let f = fixture(&store).await;
        let Database::Sqlite(pool) = &store.db else {
            unreachable!()
        };
        let statements = Statements::new(str::to_string);
        let rows = query(&statements.assets_of_component)
            .bind(f.old_component)
            .fetch_all(pool)
            .await
            .unwrap();
        let assets: Vec<Asset> = rows.iter().map(decode_asset).collect::<Result<_, _>>().unwrap();

        assert_eq!(assets.len(), 2);
        assert!(assets.iter().all(|a| a.last_downloaded.is_none()));
        assert!(assets[0].blob_updated < Utc::now() - chrono::Duration::days(59));
    }
}
