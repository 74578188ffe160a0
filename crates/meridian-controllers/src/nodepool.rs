//! NodePool Reconciler: one `NodePool` record per group of nodes.
//!
//! Pool membership comes from the meridian pool label, then the GKE and AKS
//! pool labels; unlabelled nodes fall in [`DEFAULT_NODE_POOL`]. Every member
//! ends up carrying the meridian label so the cluster scheduler can find
//! pools by it.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use meridian_core::keys::{
    DEFAULT_NODE_POOL, LABEL_AKS_NODE_POOL, LABEL_GKE_NODE_POOL, LABEL_NODE_POOL,
};
use meridian_core::{Kind, Node, NodePool, ObjectKey, ObjectMeta};
use meridian_reconcile::Reconciler;
use meridian_state::{Clusters, StateResult, StoreEvent};
use tracing::{debug, info};

use crate::error::{ControllerError, ControllerResult};

/// Pool a node belongs to, by label priority.
pub fn pool_of(meta: &ObjectMeta) -> &str {
    [LABEL_NODE_POOL, LABEL_GKE_NODE_POOL, LABEL_AKS_NODE_POOL]
        .iter()
        .find_map(|k| meta.label(k).filter(|v| !v.is_empty()))
        .unwrap_or(DEFAULT_NODE_POOL)
}

pub struct NodePoolReconciler {
    clusters: Clusters,
}

impl NodePoolReconciler {
    pub fn new(clusters: Clusters) -> Self {
        Self { clusters }
    }

    /// Pool keys touched by a node or node pool event.
    pub fn keys_for(event: &StoreEvent) -> Vec<ObjectKey> {
        let pool = match event.kind {
            Kind::Node => pool_of(&event.meta),
            Kind::NodePool => event.meta.name.as_str(),
            _ => return Vec::new(),
        };
        vec![ObjectKey::new(&event.cluster, "", pool)]
    }

    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Option<Duration>> {
        let store = self.clusters.get(&key.cluster)?;
        let name = key.name.as_str();
        let mut nodes: Vec<Node> = store
            .list_all::<Node>()?
            .into_iter()
            .filter(|n| !n.is_virtual() && pool_of(&n.meta) == name)
            .collect();

        match store.get::<NodePool>("", name)? {
            None => {
                let Some(first) = nodes.first() else {
                    return Ok(None);
                };
                let count = u32::try_from(nodes.len()).unwrap_or(u32::MAX);
                let pool = NodePool {
                    meta: ObjectMeta::new("", name),
                    min_nodes: count,
                    max_nodes: count,
                    node_labels: BTreeMap::from([(LABEL_NODE_POOL.to_string(), name.to_string())]),
                    // Members are assumed to share one shape.
                    allocatable: first.allocatable.clone(),
                };
                store.create(&pool)?;
                info!(cluster = %key.cluster, pool = name, nodes = count, "node pool created");
            }
            Some(mut pool) => {
                for n in store.list::<Node>(&pool.node_labels)? {
                    if !n.is_virtual() && !nodes.iter().any(|m| m.meta.name == n.meta.name) {
                        nodes.push(n);
                    }
                }
                if let Some(first) = nodes.first() {
                    if first.allocatable != pool.allocatable {
                        pool.allocatable = first.allocatable.clone();
                        ignore_conflict(store.update(&pool))?;
                        debug!(cluster = %key.cluster, pool = name, "node pool allocatable updated");
                    }
                }
            }
        }

        for mut node in nodes {
            if node.meta.label(LABEL_NODE_POOL) != Some(name) {
                node.meta
                    .labels
                    .insert(LABEL_NODE_POOL.to_string(), name.to_string());
                ignore_conflict(store.update(&node))?;
            }
        }
        Ok(None)
    }
}

/// A conflicting write means a newer version is on its way back through the watch.
fn ignore_conflict<T>(result: StateResult<T>) -> StateResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_conflict() => Ok(()),
        Err(e) => Err(e),
    }
}

impl Reconciler for NodePoolReconciler {
    type Key = ObjectKey;
    type Error = ControllerError;

    fn handle(
        &self,
        key: &ObjectKey,
    ) -> impl Future<Output = Result<Option<Duration>, ControllerError>> + Send {
        self.reconcile(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::keys::{LABEL_VIRTUAL_KUBELET_PROVIDER, VIRTUAL_KUBELET_PROVIDER_NAME};
    use meridian_core::Quantity;
    use meridian_state::EventAction;

    fn node(name: &str, labels: &[(&str, &str)], cpu: i64) -> Node {
        let mut n = Node {
            meta: ObjectMeta::new("", name),
            ..Default::default()
        };
        for (k, v) in labels {
            n.meta.labels.insert(k.to_string(), v.to_string());
        }
        n.allocatable.insert("cpu".into(), Quantity::from_units(cpu));
        n
    }

    fn setup(nodes: Vec<Node>) -> (Clusters, NodePoolReconciler) {
        let clusters = Clusters::in_memory(["c1"]).unwrap();
        for n in nodes {
            clusters.get("c1").unwrap().create(&n).unwrap();
        }
        let r = NodePoolReconciler::new(clusters.clone());
        (clusters, r)
    }

    #[test]
    fn label_priority() {
        let gke = node("a", &[(LABEL_GKE_NODE_POOL, "gpu"), (LABEL_AKS_NODE_POOL, "x")], 1);
        assert_eq!(pool_of(&gke.meta), "gpu");
        let both = node("b", &[(LABEL_NODE_POOL, "spot"), (LABEL_GKE_NODE_POOL, "gpu")], 1);
        assert_eq!(pool_of(&both.meta), "spot");
        assert_eq!(pool_of(&node("c", &[(LABEL_AKS_NODE_POOL, "ap1")], 1).meta), "ap1");
        assert_eq!(pool_of(&node("d", &[], 1).meta), DEFAULT_NODE_POOL);
    }

    #[tokio::test]
    async fn creates_pool_and_stamps_members() {
        let (clusters, r) = setup(vec![
            node("n1", &[(LABEL_GKE_NODE_POOL, "gpu")], 4),
            node("n2", &[(LABEL_GKE_NODE_POOL, "gpu")], 4),
            node("n3", &[], 2),
        ]);
        let store = clusters.get("c1").unwrap();
        r.handle(&ObjectKey::new("c1", "", "gpu")).await.unwrap();

        let pool: NodePool = store.get("", "gpu").unwrap().unwrap();
        assert_eq!((pool.min_nodes, pool.max_nodes), (2, 2));
        assert_eq!(pool.allocatable["cpu"].millis(), 4000);
        for name in ["n1", "n2"] {
            let n: Node = store.get("", name).unwrap().unwrap();
            assert_eq!(n.pool(), "gpu");
        }
        let n3: Node = store.get("", "n3").unwrap().unwrap();
        assert!(n3.meta.label(LABEL_NODE_POOL).is_none());

        let writes = store.writes();
        r.handle(&ObjectKey::new("c1", "", "gpu")).await.unwrap();
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn virtual_nodes_stay_out() {
        let (clusters, r) = setup(vec![node(
            "meridian-c2",
            &[(LABEL_VIRTUAL_KUBELET_PROVIDER, VIRTUAL_KUBELET_PROVIDER_NAME)],
            100,
        )]);
        r.handle(&ObjectKey::new("c1", "", DEFAULT_NODE_POOL)).await.unwrap();
        let store = clusters.get("c1").unwrap();
        assert!(store.get::<NodePool>("", DEFAULT_NODE_POOL).unwrap().is_none());
    }

    #[tokio::test]
    async fn existing_pool_follows_node_shape() {
        let (clusters, r) = setup(vec![node("n1", &[], 8)]);
        let store = clusters.get("c1").unwrap();
        let mut pool = NodePool {
            meta: ObjectMeta::new("", DEFAULT_NODE_POOL),
            min_nodes: 1,
            max_nodes: 3,
            ..Default::default()
        };
        pool.allocatable.insert("cpu".into(), Quantity::from_units(2));
        store.create(&pool).unwrap();

        r.handle(&ObjectKey::new("c1", "", DEFAULT_NODE_POOL)).await.unwrap();
        let pool: NodePool = store.get("", DEFAULT_NODE_POOL).unwrap().unwrap();
        assert_eq!(pool.allocatable["cpu"].millis(), 8000);
        assert_eq!(pool.max_nodes, 3);
    }

    #[test]
    fn node_events_map_to_pool() {
        let n = node("n1", &[(LABEL_AKS_NODE_POOL, "ap1")], 1);
        let event = StoreEvent {
            cluster: "c1".into(),
            kind: Kind::Node,
            action: EventAction::Added,
            meta: n.meta,
        };
        assert_eq!(
            NodePoolReconciler::keys_for(&event),
            vec![ObjectKey::new("c1", "", "ap1")]
        );
    }
}
