//! Meridian placement — cluster scoring and node fitting.
//!
//! This crate makes pure placement decisions; it never reads or writes a
//! store. Callers gather observations and act on the result.
//!
//! # Components
//!
//! - **`cluster`** — Cluster-pair scheduling: pick a target cluster from
//!   aggregate capacity (nodes, elastic node pools, running and pending pods)
//! - **`scorer`** — Node scoring inside one cluster (fit, bin-packing, balance)
//! - **`convert`** — Conversions from store records to placement inputs

pub mod cluster;
pub mod convert;
pub mod scorer;

pub use cluster::{
    BasicScheduler, ClusterObservations, ClusterScheduler, ClusterScore, Observations,
    PlacementError, rank_clusters,
};
pub use convert::{node_to_resources, pod_to_requirements};
pub use scorer::{NodeResources, NodeScore, PlacementRequirements, ScoringWeights, rank_nodes, score_node};
