//! ClusterStore — redb-backed record store for one cluster.
//!
//! Provides typed CRUD over every [`Object`] kind with optimistic
//! concurrency, a status subresource, finalizer-aware deletion and a
//! broadcast stream of [`StoreEvent`]s. The store supports both on-disk and
//! in-memory backends (the latter for testing and ephemeral clusters).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use meridian_core::{Object, ObjectMeta, table_key};
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::events::{EventAction, StoreEvent};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const EVENT_CAPACITY: usize = 1024;

/// Thread-safe store for one cluster's records.
#[derive(Clone)]
pub struct ClusterStore {
    cluster: Arc<str>,
    db: Arc<Database>,
    events: broadcast::Sender<StoreEvent>,
    synced: Arc<watch::Sender<bool>>,
    writes: Arc<AtomicU64>,
    reachable: Arc<AtomicBool>,
    forbidden_namespaces: Arc<RwLock<BTreeSet<String>>>,
}

impl ClusterStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(cluster: &str, path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(cluster, db);
        store.ensure_tables()?;
        debug!(cluster, ?path, "cluster store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory(cluster: &str) -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(cluster, db);
        store.ensure_tables()?;
        debug!(cluster, "in-memory cluster store opened");
        Ok(store)
    }

    fn with_database(cluster: &str, db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (synced, _) = watch::channel(false);
        Self {
            cluster: Arc::from(cluster),
            db: Arc::new(db),
            events,
            synced: Arc::new(synced),
            writes: Arc::new(AtomicU64::new(0)),
            reachable: Arc::new(AtomicBool::new(true)),
            forbidden_namespaces: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PODS).map_err(map_err!(Table))?;
        txn.open_table(CHAPERONS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(NODE_POOLS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    // ── Watch & cache state ────────────────────────────────────────

    /// Receive every write made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Flip the cache-sync gate; reconcilers wait for it before working.
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolve once the cache-sync gate is open.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Number of successful writes since the store was opened.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Simulate losing (or regaining) connectivity to this cluster.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Refuse creation of namespaced records in `namespace`.
    pub fn forbid_namespace(&self, namespace: &str) {
        if let Ok(mut set) = self.forbidden_namespaces.write() {
            set.insert(namespace.to_string());
        }
    }

    /// Whether records may be created in `namespace`.
    pub fn allows_namespace(&self, namespace: &str) -> bool {
        self.forbidden_namespaces
            .read()
            .map(|set| !set.contains(namespace))
            .unwrap_or(true)
    }

    fn check_reachable(&self) -> StateResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StateError::Unavailable(self.cluster.to_string()))
        }
    }

    fn publish(&self, action: EventAction, kind: meridian_core::Kind, meta: &ObjectMeta) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        // No receivers is not an error.
        let _ = self.events.send(StoreEvent {
            cluster: self.cluster.to_string(),
            kind,
            action,
            meta: meta.clone(),
        });
    }

    /// Allocate the next resource version inside `txn`.
    fn next_resource_version(txn: &WriteTransaction) -> StateResult<u64> {
        let mut table = txn.open_table(META).map_err(map_err!(Table))?;
        let current = table
            .get(RESOURCE_VERSION_KEY)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        let next = current + 1;
        table
            .insert(RESOURCE_VERSION_KEY, next)
            .map_err(map_err!(Write))?;
        Ok(next)
    }

    fn uid(&self, kind: meridian_core::Kind, key: &str, rv: u64) -> String {
        let digest = Sha256::digest(format!("{}/{kind}/{key}/{rv}", self.cluster).as_bytes());
        hex::encode(&digest[..16])
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get a record by namespace and name (namespace empty for cluster-scoped kinds).
    pub fn get<T: Object>(&self, namespace: &str, name: &str) -> StateResult<Option<T>> {
        self.check_reachable()?;
        let key = table_key(namespace, name);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(table_for(T::KIND))
            .map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let obj: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    /// List records whose labels contain every pair of `selector`.
    pub fn list<T: Object>(&self, selector: &BTreeMap<String, String>) -> StateResult<Vec<T>> {
        self.check_reachable()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(table_for(T::KIND))
            .map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let obj: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if obj.meta().matches(selector) {
                results.push(obj);
            }
        }
        Ok(results)
    }

    pub fn list_all<T: Object>(&self) -> StateResult<Vec<T>> {
        self.list(&BTreeMap::new())
    }

    /// List records of one namespace matching `selector`.
    pub fn list_namespaced<T: Object>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StateResult<Vec<T>> {
        let mut items = self.list::<T>(selector)?;
        items.retain(|o| o.meta().namespace == namespace);
        Ok(items)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Create a record. Assigns uid, resource version and creation time.
    pub fn create<T: Object>(&self, obj: &T) -> StateResult<T> {
        self.check_reachable()?;
        let namespace = &obj.meta().namespace;
        if !namespace.is_empty() && !self.allows_namespace(namespace) {
            return Err(StateError::Forbidden {
                cluster: self.cluster.to_string(),
                namespace: namespace.clone(),
            });
        }

        let key = obj.meta().table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let rv = Self::next_resource_version(&txn)?;
        let mut created = obj.clone();
        {
            let mut table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(format!("{} {key}", T::KIND)));
            }
            let meta = created.meta_mut();
            if meta.uid.is_empty() {
                meta.uid = self.uid(T::KIND, &key, rv);
            }
            meta.resource_version = rv;
            meta.creation_timestamp = epoch_secs();
            meta.deletion_timestamp = None;
            let value = serde_json::to_vec(&created).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster = %self.cluster, kind = %T::KIND, %key, rv, "record created");
        self.publish(EventAction::Added, T::KIND, created.meta());
        Ok(created)
    }

    /// Replace metadata and spec. The stored status is kept.
    ///
    /// Fails with `Conflict` when `obj` carries a stale resource version. A
    /// terminating record whose last finalizer is removed is deleted.
    pub fn update<T: Object>(&self, obj: &T) -> StateResult<T> {
        self.check_reachable()?;
        let key = obj.meta().table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let rv = Self::next_resource_version(&txn)?;
        let mut next = obj.clone();
        let action;
        {
            let mut table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            let existing: T = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("{} {key}", T::KIND))),
            };
            check_version(&key, existing.meta(), obj.meta())?;

            next.set_status_from(&existing);
            let meta = next.meta_mut();
            meta.uid = existing.meta().uid.clone();
            meta.creation_timestamp = existing.meta().creation_timestamp;
            meta.deletion_timestamp = existing.meta().deletion_timestamp;
            meta.resource_version = rv;

            if next.meta().is_terminating() && next.meta().finalizers.is_empty() {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
                action = EventAction::Deleted;
            } else {
                let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                action = EventAction::Modified;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster = %self.cluster, kind = %T::KIND, %key, rv, ?action, "record updated");
        self.publish(action, T::KIND, next.meta());
        Ok(next)
    }

    /// Replace only the status of a record.
    pub fn update_status<T: Object>(&self, obj: &T) -> StateResult<T> {
        self.check_reachable()?;
        let key = obj.meta().table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let rv = Self::next_resource_version(&txn)?;
        let next;
        {
            let mut table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            let mut existing: T = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("{} {key}", T::KIND))),
            };
            check_version(&key, existing.meta(), obj.meta())?;

            existing.set_status_from(obj);
            existing.meta_mut().resource_version = rv;
            let value = serde_json::to_vec(&existing).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            next = existing;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster = %self.cluster, kind = %T::KIND, %key, rv, "status updated");
        self.publish(EventAction::Modified, T::KIND, next.meta());
        Ok(next)
    }

    /// Delete a record. Returns false if it did not exist.
    ///
    /// A record with finalizers is only marked terminating; the finalizer
    /// owners remove it by clearing their finalizer through `update`.
    pub fn delete<T: Object>(&self, namespace: &str, name: &str) -> StateResult<bool> {
        self.check_reachable()?;
        let key = table_key(namespace, name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let rv = Self::next_resource_version(&txn)?;
        let outcome;
        {
            let mut table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            let mut existing: T = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Ok(false),
            };
            if existing.meta().finalizers.is_empty() {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
                outcome = Some((EventAction::Deleted, existing));
            } else if existing.meta().is_terminating() {
                outcome = None;
            } else {
                let meta = existing.meta_mut();
                meta.deletion_timestamp = Some(epoch_secs());
                meta.resource_version = rv;
                let value = serde_json::to_vec(&existing).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                outcome = Some((EventAction::Modified, existing));
            }
        }
        match outcome {
            Some((action, obj)) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(cluster = %self.cluster, kind = %T::KIND, %key, ?action, "record deleted");
                self.publish(action, T::KIND, obj.meta());
            }
            None => txn.abort().map_err(map_err!(Transaction))?,
        }
        Ok(true)
    }

    /// Delete every record of a namespace matching `selector`. Returns how many existed.
    pub fn delete_collection<T: Object>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StateResult<usize> {
        let mut deleted = 0;
        for obj in self.list_namespaced::<T>(namespace, selector)? {
            if self.delete::<T>(namespace, &obj.meta().name)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn check_version(key: &str, stored: &ObjectMeta, incoming: &ObjectMeta) -> StateResult<()> {
    if stored.resource_version != incoming.resource_version {
        return Err(StateError::Conflict {
            key: key.to_string(),
            expected: incoming.resource_version,
            actual: stored.resource_version,
        });
    }
    Ok(())
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::*;

    fn store() -> ClusterStore {
        ClusterStore::open_in_memory("c1").unwrap()
    }

    fn test_pod(namespace: &str, name: &str) -> Pod {
        let mut pod = Pod {
            meta: ObjectMeta::new(namespace, name),
            ..Default::default()
        };
        pod.meta.labels.insert("app".into(), name.into());
        pod
    }

    fn test_node(name: &str, cpu: &str) -> Node {
        let mut node = Node {
            meta: ObjectMeta::new("", name),
            ..Default::default()
        };
        node.allocatable.insert("cpu".into(), cpu.parse().unwrap());
        node
    }

    #[test]
    fn create_and_get() {
        let store = store();
        let created = store.create(&test_pod("ns1", "pod1")).unwrap();
        assert!(!created.meta.uid.is_empty());
        assert!(created.meta.resource_version > 0);

        let got: Pod = store.get("ns1", "pod1").unwrap().unwrap();
        assert_eq!(got, created);
        assert!(store.get::<Pod>("ns1", "missing").unwrap().is_none());
        assert!(store.get::<Chaperon>("ns1", "pod1").unwrap().is_none());
    }

    #[test]
    fn create_twice_fails() {
        let store = store();
        store.create(&test_pod("ns1", "pod1")).unwrap();
        let err = store.create(&test_pod("ns1", "pod1")).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn cluster_scoped_records() {
        let store = store();
        store.create(&test_node("n1", "4")).unwrap();
        store.create(&test_node("n2", "2")).unwrap();
        let nodes: Vec<Node> = store.list_all().unwrap();
        assert_eq!(nodes.len(), 2);
        let n1: Node = store.get("", "n1").unwrap().unwrap();
        assert_eq!(n1.allocatable["cpu"].millis(), 4000);
    }

    #[test]
    fn stale_update_conflicts() {
        let store = store();
        let created = store.create(&test_pod("ns1", "pod1")).unwrap();

        let mut first = created.clone();
        first.meta.annotations.insert("a".into(), "1".into());
        store.update(&first).unwrap();

        let mut second = created;
        second.meta.annotations.insert("b".into(), "2".into());
        let err = store.update(&second).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn update_keeps_status_and_update_status_keeps_spec() {
        let store = store();
        let created = store.create(&test_pod("ns1", "pod1")).unwrap();

        let mut with_status = created.clone();
        with_status.status.phase = Some(PodPhase::Running);
        let after_status = store.update_status(&with_status).unwrap();
        assert_eq!(after_status.status.phase, Some(PodPhase::Running));

        let mut with_spec = after_status.clone();
        with_spec.spec.node_name = Some("n1".into());
        with_spec.status.phase = Some(PodPhase::Failed);
        let after_spec = store.update(&with_spec).unwrap();
        assert_eq!(after_spec.spec.node_name.as_deref(), Some("n1"));
        assert_eq!(after_spec.status.phase, Some(PodPhase::Running));

        let mut status_only = after_spec.clone();
        status_only.spec.node_name = None;
        status_only.status.phase = Some(PodPhase::Succeeded);
        let last = store.update_status(&status_only).unwrap();
        assert_eq!(last.spec.node_name.as_deref(), Some("n1"));
        assert_eq!(last.status.phase, Some(PodPhase::Succeeded));
    }

    #[test]
    fn update_missing_is_not_found() {
        let store = store();
        let err = store.update(&test_pod("ns1", "ghost")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_without_finalizers_removes() {
        let store = store();
        store.create(&test_pod("ns1", "pod1")).unwrap();
        assert!(store.delete::<Pod>("ns1", "pod1").unwrap());
        assert!(store.get::<Pod>("ns1", "pod1").unwrap().is_none());
        assert!(!store.delete::<Pod>("ns1", "pod1").unwrap());
    }

    #[test]
    fn finalizers_hold_deletion_until_released() {
        let store = store();
        let mut pod = test_pod("ns1", "pod1");
        pod.meta.finalizers.push("example/finalizer".into());
        store.create(&pod).unwrap();

        assert!(store.delete::<Pod>("ns1", "pod1").unwrap());
        let terminating: Pod = store.get("ns1", "pod1").unwrap().unwrap();
        assert!(terminating.meta.is_terminating());

        // A second delete does not write.
        let writes = store.writes();
        assert!(store.delete::<Pod>("ns1", "pod1").unwrap());
        assert_eq!(store.writes(), writes);

        let mut released = terminating;
        released.meta.finalizers.clear();
        store.update(&released).unwrap();
        assert!(store.get::<Pod>("ns1", "pod1").unwrap().is_none());
    }

    #[test]
    fn list_filters_by_selector_and_namespace() {
        let store = store();
        store.create(&test_pod("ns1", "a")).unwrap();
        store.create(&test_pod("ns1", "b")).unwrap();
        store.create(&test_pod("ns2", "a")).unwrap();

        let mut sel = BTreeMap::new();
        sel.insert("app".to_string(), "a".to_string());
        assert_eq!(store.list::<Pod>(&sel).unwrap().len(), 2);
        assert_eq!(store.list_namespaced::<Pod>("ns1", &sel).unwrap().len(), 1);
        assert_eq!(store.delete_collection::<Pod>("ns2", &sel).unwrap(), 1);
        assert_eq!(store.list::<Pod>(&sel).unwrap().len(), 1);
    }

    #[test]
    fn forbidden_namespace_and_unreachable() {
        let store = store();
        store.forbid_namespace("secret");
        let err = store.create(&test_pod("secret", "p")).unwrap_err();
        assert!(err.is_forbidden());
        assert!(!store.allows_namespace("secret"));

        store.set_reachable(false);
        assert!(matches!(
            store.get::<Pod>("ns1", "p"),
            Err(StateError::Unavailable(_))
        ));
        store.set_reachable(true);
        assert!(store.get::<Pod>("ns1", "p").unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_are_published() {
        let store = store();
        let mut rx = store.subscribe();
        let created = store.create(&test_pod("ns1", "pod1")).unwrap();
        store.delete::<Pod>("ns1", "pod1").unwrap();

        let added = rx.recv().await.unwrap();
        assert_eq!(added.action, EventAction::Added);
        assert_eq!(added.kind, Kind::Pod);
        assert_eq!(added.cluster, "c1");
        assert_eq!(added.meta.uid, created.meta.uid);
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.action, EventAction::Deleted);
        assert_eq!(store.writes(), 2);
    }

    #[test]
    fn sync_gate() {
        let store = store();
        let rx = store.synced();
        assert!(!*rx.borrow());
        store.mark_synced();
        assert!(store.is_synced());
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn wait_synced_resolves_after_mark() {
        let store = store();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_synced().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        store.mark_synced();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c1.redb");
        {
            let store = ClusterStore::open("c1", &path).unwrap();
            store.create(&test_pod("ns1", "pod1")).unwrap();
        }
        let store = ClusterStore::open("c1", &path).unwrap();
        let pod: Pod = store.get("ns1", "pod1").unwrap().unwrap();
        assert_eq!(pod.meta.name, "pod1");
        let next = store.create(&test_pod("ns1", "pod2")).unwrap();
        assert!(next.meta.resource_version > pod.meta.resource_version);
    }
}
