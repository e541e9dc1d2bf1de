use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::{ContentStore, ObjectContentStore};
use crate::config::Configuration;
use crate::storage::create_object_store;

/// The process-wide set of named content stores.
///
/// Built once at startup from configuration and handed to the services that
/// need it; stores never move between registries.
#[derive(Clone, Default)]
pub struct BlobStoreRegistry {
    stores: BTreeMap<String, Arc<dyn ContentStore>>,
}

impl BlobStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every configured store.
    pub async fn from_config(config: &Configuration) -> Result<Self> {
        let mut registry = Self::new();
        for (name, store_config) in config.effective_stores() {
            let object_store = create_object_store(&store_config)
                .with_context(|| format!("Failed to create object store for '{name}'"))?;
            let store = ObjectContentStore::open(name.clone(), object_store)
                .await
                .with_context(|| format!("Failed to open blob store '{name}'"))?;
            registry.register(Arc::new(store));
        }
        Ok(registry)
    }

    /// Add a store, replacing any store previously registered under its name.
    pub fn register(&mut self, store: Arc<dyn ContentStore>) {
        self.stores.insert(store.name().to_string(), store);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ContentStore>> {
        self.stores.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    pub fn stores(&self) -> impl Iterator<Item = &Arc<dyn ContentStore>> {
        self.stores.values()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
