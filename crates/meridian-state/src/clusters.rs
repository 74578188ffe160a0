//! Registry of cluster stores reachable from this process.

use std::collections::BTreeMap;
use std::path::Path;

use tokio::sync::watch;
use tracing::info;

use crate::error::{StateError, StateResult};
use crate::store::ClusterStore;

/// Cluster name → store. Cheap to clone; stores are shared.
#[derive(Clone, Default)]
pub struct Clusters {
    stores: BTreeMap<String, ClusterStore>,
}

impl Clusters {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory stores for each name.
    pub fn in_memory<'a>(names: impl IntoIterator<Item = &'a str>) -> StateResult<Self> {
        let mut clusters = Self::new();
        for name in names {
            clusters.insert(ClusterStore::open_in_memory(name)?);
        }
        Ok(clusters)
    }

    /// On-disk stores under `dir`, one `{name}.redb` file per cluster.
    pub fn on_disk<'a>(dir: &Path, names: impl IntoIterator<Item = &'a str>) -> StateResult<Self> {
        let mut clusters = Self::new();
        for name in names {
            let path = dir.join(format!("{name}.redb"));
            clusters.insert(ClusterStore::open(name, &path)?);
        }
        info!(count = clusters.stores.len(), ?dir, "cluster stores opened");
        Ok(clusters)
    }

    pub fn insert(&mut self, store: ClusterStore) {
        self.stores.insert(store.cluster().to_string(), store);
    }

    pub fn get(&self, cluster: &str) -> StateResult<&ClusterStore> {
        self.stores
            .get(cluster)
            .ok_or_else(|| StateError::UnknownCluster(cluster.to_string()))
    }

    /// Cluster names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterStore> {
        self.stores.values()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Sync gates of every store.
    pub fn synced(&self) -> Vec<watch::Receiver<bool>> {
        self.stores.values().map(ClusterStore::synced).collect()
    }

    pub fn mark_synced(&self) {
        for store in self.stores.values() {
            store.mark_synced();
        }
    }
}
