//! Cluster stores from configuration, and pod submission.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use meridian_core::keys::{LABEL_NODE_POOL, LABEL_VIRTUAL_KUBELET_PROVIDER, VIRTUAL_KUBELET_PROVIDER_NAME};
use meridian_core::{MeridianConfig, Node, NodePool, Object, ObjectMeta, Pod, proxypod};
use meridian_state::{ClusterStore, Clusters, StateError};
use tracing::{debug, info};

/// One store per configured cluster, on disk under `data_dir` when set.
pub fn open_clusters(config: &MeridianConfig) -> anyhow::Result<Clusters> {
    let names = config.clusters.iter().map(|c| c.name.as_str());
    let clusters = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating data directory {}", dir.display()))?;
            Clusters::on_disk(dir, names)?
        }
        None => Clusters::in_memory(names)?,
    };
    Ok(clusters)
}

/// Apply namespace restrictions and create the configured nodes, node pools
/// and one virtual node per target. Records left by a previous run are kept.
pub fn seed(config: &MeridianConfig, clusters: &Clusters) -> anyhow::Result<()> {
    for cluster in &config.clusters {
        let store = clusters.get(&cluster.name)?;
        for namespace in &cluster.forbidden_namespaces {
            store.forbid_namespace(namespace);
        }

        for node in &cluster.nodes {
            let mut meta = ObjectMeta::new("", &node.name);
            meta.labels = node.labels.clone();
            if let Some(pool) = &node.pool {
                meta.labels.insert(LABEL_NODE_POOL.to_string(), pool.clone());
            }
            create_if_missing(
                store,
                &Node {
                    meta,
                    allocatable: node.allocatable.clone(),
                    unschedulable: false,
                },
            )?;
        }

        for pool in &cluster.node_pools {
            let mut node_labels = pool.labels.clone();
            node_labels.insert(LABEL_NODE_POOL.to_string(), pool.name.clone());
            create_if_missing(
                store,
                &NodePool {
                    meta: ObjectMeta::new("", &pool.name),
                    min_nodes: pool.min_nodes.unwrap_or(0),
                    max_nodes: pool.max_nodes.unwrap_or(0),
                    node_labels,
                    allocatable: pool.allocatable.clone(),
                },
            )?;
        }

        for target in cluster.all_targets() {
            let mut meta = ObjectMeta::new("", &proxypod::virtual_node_name(&target));
            meta.labels = BTreeMap::from([(
                LABEL_VIRTUAL_KUBELET_PROVIDER.to_string(),
                VIRTUAL_KUBELET_PROVIDER_NAME.to_string(),
            )]);
            create_if_missing(
                store,
                &Node {
                    meta,
                    ..Default::default()
                },
            )?;
        }
        info!(
            cluster = %cluster.name,
            nodes = cluster.nodes.len(),
            pools = cluster.node_pools.len(),
            "cluster seeded"
        );
    }
    Ok(())
}

fn create_if_missing<T: Object>(store: &ClusterStore, obj: &T) -> anyhow::Result<()> {
    match store.create(obj) {
        Ok(_) => Ok(()),
        Err(StateError::AlreadyExists(what)) => {
            debug!(cluster = store.cluster(), %what, "already seeded");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Read a pod manifest (JSON).
pub fn load_pod(path: &Path) -> anyhow::Result<Pod> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let pod = serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(pod)
}

/// Admit `pod` into `store`: pods marked for election become proxy pods.
pub fn submit(store: &ClusterStore, pod: &Pod) -> anyhow::Result<Pod> {
    let admitted = proxypod::mutate(pod)?;
    let created = store.create(&admitted)?;
    info!(
        cluster = store.cluster(),
        pod = %created.meta.table_key(),
        proxy = proxypod::is_proxy(&created),
        "pod submitted"
    );
    Ok(created)
}
