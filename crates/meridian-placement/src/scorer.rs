//! Node scoring inside a single cluster.
//!
//! Evaluates candidate nodes using a weighted combination of:
//! - **Bin-packing** (best-fit): prefer nodes that will be most full after placement
//! - **Balance**: prefer nodes close to the cluster's average utilization
//! - **Fit**: reject nodes that are cordoned, virtual, off-selector or too small

use std::collections::BTreeMap;

use meridian_core::{Quantity, ResourceList};

/// Resource capacity and usage for a single node.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct NodeResources {
    pub node_name: String,
    pub labels: BTreeMap<String, String>,
    pub allocatable: ResourceList,
    /// Requests of the pods bound to the node plus its reservations.
    pub used: ResourceList,
    pub unschedulable: bool,
    /// Stands for a whole remote cluster; never a fit target.
    pub is_virtual: bool,
}

impl NodeResources {
    /// Unreserved amount of `resource`; zero when the node does not offer it.
    pub fn free(&self, resource: &str) -> Quantity {
        let allocatable = self.allocatable.get(resource).copied().unwrap_or_default();
        let used = self.used.get(resource).copied().unwrap_or_default();
        allocatable.saturating_sub(used)
    }

    /// Mean `used / allocatable` over `resources` the node offers.
    fn utilization<'a>(&self, resources: impl Iterator<Item = &'a String>) -> Option<f64> {
        let ratios: Vec<f64> = resources
            .filter_map(|r| {
                let alloc = self.allocatable.get(r)?.millis();
                if alloc <= 0 {
                    return None;
                }
                let used = self.used.get(r).copied().unwrap_or_default().millis();
                Some(used as f64 / alloc as f64)
            })
            .collect();
        if ratios.is_empty() {
            None
        } else {
            Some(ratios.iter().sum::<f64>() / ratios.len() as f64)
        }
    }
}

/// Requirements of one pod.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PlacementRequirements {
    pub requests: ResourceList,
    /// Required label matches (all must match).
    pub node_selector: BTreeMap<String, String>,
}

impl PlacementRequirements {
    /// Requested resources with a positive amount.
    pub fn positive_requests(&self) -> impl Iterator<Item = (&String, &Quantity)> {
        self.requests.iter().filter(|(_, q)| q.millis() > 0)
    }
}

/// Scored placement result for a single node.
#[derive(Debug, Clone)]
pub struct NodeScore {
    pub node_name: String,
    /// Total composite score (higher = better). Range: 0.0..=100.0.
    pub score: f64,
    /// How many such pods this node can still accept.
    pub capacity: u64,
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    pub bin_packing: f64,
    pub balance: f64,
}

#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub bin_packing: f64,
    pub balance: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            bin_packing: 0.6,
            balance: 0.4,
        }
    }
}

/// Whether `node` may run a pod with `req` at all, ignoring capacity.
pub fn node_matches(node: &NodeResources, req: &PlacementRequirements) -> bool {
    !node.unschedulable
        && !node.is_virtual
        && req
            .node_selector
            .iter()
            .all(|(k, v)| node.labels.get(k).is_some_and(|l| l == v))
}

/// Score a single node for the given requirements.
pub fn score_node(
    node: &NodeResources,
    req: &PlacementRequirements,
    weights: &ScoringWeights,
    cluster_avg_utilization: f64,
) -> Option<NodeScore> {
    if !node_matches(node, req) {
        return None;
    }

    let capacity = req
        .positive_requests()
        .map(|(r, q)| node.free(r).fits(*q))
        .min()
        .unwrap_or(u64::MAX);
    if capacity == 0 {
        return None;
    }

    // Bin-packing score: projected utilization of the requested resources.
    let mut projected = node.clone();
    for (r, q) in req.positive_requests() {
        let used = projected.used.entry(r.clone()).or_default();
        *used = used.saturating_add(*q);
    }
    let bin_packing = projected
        .utilization(req.requests.keys())
        .map(|u| u.min(1.0) * 100.0)
        .unwrap_or(50.0);

    let node_util = node.utilization(node.allocatable.keys()).unwrap_or(0.5);
    let balance = (1.0 - (node_util - cluster_avg_utilization).abs()).max(0.0) * 100.0;

    let score = weights.bin_packing * bin_packing + weights.balance * balance;

    Some(NodeScore {
        node_name: node.node_name.clone(),
        score,
        capacity,
        breakdown: ScoreBreakdown {
            bin_packing,
            balance,
        },
    })
}

/// Score all nodes and return the fitting ones, best first; ties by name.
pub fn rank_nodes(
    nodes: &[NodeResources],
    req: &PlacementRequirements,
    weights: &ScoringWeights,
) -> Vec<NodeScore> {
    let utils: Vec<f64> = nodes
        .iter()
        .filter(|n| !n.is_virtual)
        .map(|n| n.utilization(n.allocatable.keys()).unwrap_or(0.5))
        .collect();
    let cluster_avg = if utils.is_empty() {
        0.5
    } else {
        utils.iter().sum::<f64>() / utils.len() as f64
    };

    let mut scores: Vec<NodeScore> = nodes
        .iter()
        .filter_map(|n| score_node(n, req, weights, cluster_avg))
        .collect();

    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_name.cmp(&b.node_name))
    });
    scores
}
