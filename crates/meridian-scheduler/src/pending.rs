//! In-memory table of placement decisions the target cluster does not show yet.
//!
//! Keyed by `(target cluster, namespace, name)` and sharded by target
//! cluster, so the scheduler shim reads one shard per eligible cluster. The
//! table never persists; after a restart the stores already show every
//! delegate the lost entries stood for, or the proxy is decided again.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use meridian_core::Pod;

/// One decision: the pod spec the target is expected to receive.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDecision {
    pub source_cluster: String,
    pub pod: Pod,
}

type Shard = BTreeMap<(String, String), PendingDecision>;

#[derive(Debug, Default)]
pub struct PendingDecisions {
    shards: Mutex<BTreeMap<String, Shard>>,
}

impl PendingDecisions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Shard>> {
        self.shards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record that `pod` from `source_cluster` was decided onto `target`.
    /// Replaces an earlier decision for the same key.
    pub fn insert(&self, target: &str, source_cluster: &str, pod: Pod) {
        let key = (pod.meta.namespace.clone(), pod.meta.name.clone());
        self.lock().entry(target.to_string()).or_default().insert(
            key,
            PendingDecision {
                source_cluster: source_cluster.to_string(),
                pod,
            },
        );
    }

    /// Remove one decision. Removing a missing key is a no-op.
    pub fn remove(&self, target: &str, namespace: &str, name: &str) -> Option<PendingDecision> {
        let mut shards = self.lock();
        let shard = shards.get_mut(target)?;
        let removed = shard.remove(&(namespace.to_string(), name.to_string()));
        if shard.is_empty() {
            shards.remove(target);
        }
        removed
    }

    /// Remove the decisions made for proxy `namespace/name` of `source_cluster`
    /// in every target except `keep`. Returns how many were removed.
    pub fn remove_by_source(
        &self,
        source_cluster: &str,
        namespace: &str,
        name: &str,
        keep: Option<&str>,
    ) -> usize {
        let key = (namespace.to_string(), name.to_string());
        let mut removed = 0;
        let mut shards = self.lock();
        for (target, shard) in shards.iter_mut() {
            if keep == Some(target.as_str()) {
                continue;
            }
            if shard
                .get(&key)
                .is_some_and(|d| d.source_cluster == source_cluster)
            {
                shard.remove(&key);
                removed += 1;
            }
        }
        shards.retain(|_, shard| !shard.is_empty());
        removed
    }

    pub fn contains(&self, target: &str, namespace: &str, name: &str) -> bool {
        self.lock()
            .get(target)
            .is_some_and(|s| s.contains_key(&(namespace.to_string(), name.to_string())))
    }

    /// Pods decided onto `target`.
    pub fn for_cluster(&self, target: &str) -> Vec<Pod> {
        self.lock()
            .get(target)
            .map(|s| s.values().map(|d| d.pod.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
