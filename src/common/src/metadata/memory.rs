use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    Asset, BlobRef, CleanupCriteria, Component, DeletedItems, ItemId, MetadataResult,
    MetadataStore, NewAsset, select_components,
};
use crate::blob::BlobId;

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    components: BTreeMap<i64, Component>,
    assets: BTreeMap<i64, Asset>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Metadata held in process memory, used in tests and config-less runs.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    state: RwLock<State>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_component(
        &self,
        repository: &str,
        name: &str,
        version: &str,
    ) -> MetadataResult<i64> {
        let mut state = self.state.write().await;
        let id = state.next_id();
        state.components.insert(
            id,
            Component {
                id,
                repository: repository.to_string(),
                name: name.to_string(),
                version: version.to_string(),
            },
        );
        Ok(id)
    }

    pub async fn create_asset(&self, asset: NewAsset) -> MetadataResult<i64> {
        let mut state = self.state.write().await;
        let id = state.next_id();
        state.assets.insert(
            id,
            Asset {
                id,
                component_id: asset.component_id,
                repository: asset.repository,
                path: asset.path,
                blob: asset.blob,
                blob_updated: asset.blob_updated,
                last_downloaded: asset.last_downloaded,
            },
        );
        Ok(id)
    }

    pub async fn mark_downloaded(&self, asset_id: i64, at: DateTime<Utc>) -> MetadataResult<bool> {
        let mut state = self.state.write().await;
        Ok(match state.assets.get_mut(&asset_id) {
            Some(asset) => {
                asset.last_downloaded = Some(at);
                true
            }
            None => false,
        })
    }

    pub async fn component_count(&self, repository: &str) -> usize {
        let state = self.state.read().await;
        state
            .components
            .values()
            .filter(|c| c.repository == repository)
            .count()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn is_blob_referenced(
        &self,
        store_name: &str,
        blob_id: &BlobId,
    ) -> MetadataResult<bool> {
        let state = self.state.read().await;
        Ok(state
            .assets
            .values()
            .any(|a| a.blob.store_name == store_name && &a.blob.blob_id == blob_id))
    }

    async fn find_components(
        &self,
        repository: &str,
        criteria: &CleanupCriteria,
    ) -> MetadataResult<Vec<ItemId>> {
        let state = self.state.read().await;
        Ok(select_components(
            state.components.values().filter(|c| c.repository == repository),
            state.assets.values().filter(|a| a.repository == repository),
            criteria,
            Utc::now(),
        ))
    }

    async fn delete_items(
        &self,
        repository: &str,
        items: &[ItemId],
    ) -> MetadataResult<DeletedItems> {
        let mut state = self.state.write().await;
        let mut deleted = DeletedItems::default();
        let mut seen: HashSet<BlobRef> = HashSet::new();

        for item in items {
            let asset_ids: Vec<i64> = match *item {
                ItemId::Component(id) => {
                    let owned = state
                        .components
                        .get(&id)
                        .is_some_and(|c| c.repository == repository);
                    if !owned {
                        continue;
                    }
                    state.components.remove(&id);
                    deleted.components += 1;
                    state
                        .assets
                        .values()
                        .filter(|a| a.component_id == Some(id))
                        .map(|a| a.id)
                        .collect()
                }
                ItemId::Asset(id) => state
                    .assets
                    .get(&id)
                    .filter(|a| a.repository == repository)
                    .map(|a| vec![a.id])
                    .unwrap_or_default(),
            };

            for asset_id in asset_ids {
                if let Some(asset) = state.assets.remove(&asset_id) {
                    deleted.assets += 1;
                    if seen.insert(asset.blob.clone()) {
                        deleted.blobs.push(asset.blob);
                    }
                }
            }
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract::{self, Fixture, asset};
    use super::*;

    async fn fixture(store: &InMemoryMetadataStore) -> Fixture {
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
        let store = InMemoryMetadataStore::new();
        let f = fixture(&store).await;
        contract::find_components_applies_criteria(&store, &f).await;
    }

    #[tokio::test]
    async fn test_shared_blob_stays_referenced() {
        let store = InMemoryMetadataStore::new();
        let f = fixture(&store).await;
        contract::shared_blob_stays_referenced(&store, &f).await;
        assert_eq!(store.component_count("maven").await, 1);
    }

    #[tokio::test]
    async fn test_delete_skips_foreign_and_missing_items() {
        let store = InMemoryMetadataStore::new();
        let f = fixture(&store).await;
        contract::delete_skips_foreign_and_missing_items(&store, &f).await;
        assert_eq!(store.component_count("npm").await, 1);
    }

    #[tokio::test]
    async fn test_recent_download_protects_component() {
        let store = InMemoryMetadataStore::new();
        let f = fixture(&store).await;
        let criteria = contract::criteria(&[(super::super::LAST_DOWNLOADED, "30")]);

        let before = store.find_components("npm", &criteria).await.unwrap();
        assert_eq!(before, vec![ItemId::Component(f.other_repo_component)]);

                assert!(store.mark_downloaded(f.npm_asset, Utc::now()).await.unwrap());
        assert!(store.find_components("npm", &criteria).await.unwrap().is_empty());
    }
}
