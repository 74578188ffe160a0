//! Cluster-pair scheduling — pick the target cluster for a proxy pod.
//!
//! Each eligible cluster gets an aggregate score: how many copies of the pod
//! its remaining capacity still fits. Remaining capacity is the allocatable
//! of the real nodes matching the pod's node selector, plus the headroom of
//! node pools that may still grow, minus what running pods and pending
//! decisions already claim.

use std::collections::BTreeMap;

use meridian_core::keys::LABEL_NODE_POOL;
use meridian_core::{Node, NodePool, Pod, ResourceList, proxypod, quantity};
use tracing::debug;

use crate::convert::pod_to_requirements;
use crate::scorer::PlacementRequirements;

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("invalid request for pod {pod}: {reason}")]
    InvalidRequest { pod: String, reason: String },

    #[error("observation failed: {0}")]
    Observation(String),
}

/// What the scheduler sees of one candidate cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterObservations {
    pub nodes: Vec<Node>,
    pub node_pools: Vec<NodePool>,
    pub pods: Vec<Pod>,
    /// Pods already decided onto this cluster that it does not show yet.
    pub pending: Vec<Pod>,
}

/// Observations of every eligible cluster, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Observations {
    clusters: BTreeMap<String, ClusterObservations>,
}

impl Observations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cluster: &str, observations: ClusterObservations) {
        self.clusters.insert(cluster.to_string(), observations);
    }

    pub fn cluster_mut(&mut self, cluster: &str) -> &mut ClusterObservations {
        self.clusters.entry(cluster.to_string()).or_default()
    }

    pub fn get(&self, cluster: &str) -> Option<&ClusterObservations> {
        self.clusters.get(cluster)
    }

    /// Clusters in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ClusterObservations)> {
        self.clusters.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Picks a target cluster for a pod, or none when no cluster qualifies.
pub trait ClusterScheduler: Send + Sync + 'static {
    fn schedule(&self, pod: &Pod, observations: &Observations) -> Result<Option<String>, PlacementError>;
}

/// Aggregate capacity score of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterScore {
    pub cluster: String,
    /// Copies of the pod the cluster can still take.
    pub score: u64,
}

/// Chooses the cluster that fits the most copies of the pod; ties go to the
/// first cluster in name order.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicScheduler;

impl ClusterScheduler for BasicScheduler {
    fn schedule(&self, pod: &Pod, observations: &Observations) -> Result<Option<String>, PlacementError> {
        let req = pod_to_requirements(&pod.spec);
        if let Some((resource, _)) = req.requests.iter().find(|(_, q)| q.millis() < 0) {
            return Err(PlacementError::InvalidRequest {
                pod: pod.meta.table_key(),
                reason: format!("negative {resource} request"),
            });
        }

        let ranked = rank_clusters(pod, observations);
        for score in &ranked {
            debug!(cluster = %score.cluster, score = score.score, "cluster scored");
        }
        Ok(ranked
            .into_iter()
            .find(|s| s.score >= 1)
            .map(|s| s.cluster))
    }
}

fn pool_matches(pool: &NodePool, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| {
        if k == LABEL_NODE_POOL {
            return *v == pool.meta.name;
        }
        pool.node_labels.get(k).is_some_and(|l| l == v)
    })
}

fn node_eligible(node: &Node, req: &PlacementRequirements) -> bool {
    !node.is_virtual() && !node.unschedulable && node.meta.matches(&req.node_selector)
}

/// Remaining capacity of one cluster for pods with `req`, and the number of
/// nodes (existing or still addable) that could host one.
fn remaining_capacity(obs: &ClusterObservations, req: &PlacementRequirements) -> (ResourceList, u64) {
    let mut remaining = ResourceList::new();
    let mut hosts = 0u64;

    let eligible: Vec<&Node> = obs.nodes.iter().filter(|n| node_eligible(n, req)).collect();
    for node in &eligible {
        quantity::add_into(&mut remaining, &node.allocatable);
        hosts += 1;
    }

    for pool in obs.node_pools.iter().filter(|p| pool_matches(p, &req.node_selector)) {
        let current = obs
            .nodes
            .iter()
            .filter(|n| !n.is_virtual() && n.pool() == pool.meta.name)
            .count() as u32;
        let headroom = pool.max_nodes.saturating_sub(current);
        if headroom > 0 {
            quantity::add_into(&mut remaining, &quantity::scale(&pool.allocatable, headroom));
            hosts += u64::from(headroom);
        }
    }

    for pod in &obs.pods {
        if proxypod::is_proxy(pod) || !pod.status.is_active() {
            continue;
        }
        // Pods bound elsewhere do not claim capacity the selector can reach.
        let counts = match pod.spec.node_name.as_deref() {
            Some(node) => eligible.iter().any(|n| n.meta.name == node),
            None => true,
        };
        if counts {
            quantity::sub_into(&mut remaining, &pod.spec.resource_requests());
        }
    }
    for pod in &obs.pending {
        quantity::sub_into(&mut remaining, &pod.spec.resource_requests());
    }

    (remaining, hosts)
}

/// Score every observed cluster that has nodes or node pools, best first;
/// ties by cluster name.
pub fn rank_clusters(pod: &Pod, observations: &Observations) -> Vec<ClusterScore> {
    let req = pod_to_requirements(&pod.spec);

    let mut scores: Vec<ClusterScore> = observations
        .iter()
        .filter(|(_, obs)| !obs.nodes.is_empty() || !obs.node_pools.is_empty())
        .map(|(cluster, obs)| {
            let (remaining, hosts) = remaining_capacity(obs, &req);
            let score = req
                .positive_requests()
                .map(|(r, q)| remaining.get(r).copied().unwrap_or_default().fits(*q))
                .min()
                .unwrap_or(hosts);
            ClusterScore {
                cluster: cluster.to_string(),
                score,
            }
        })
        .collect();

    scores.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.cluster.cmp(&b.cluster)));
    scores
}
