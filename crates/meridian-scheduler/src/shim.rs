//! Bridge between the stores and the cluster-pair scheduling strategy.
//!
//! Gathers observations of every eligible cluster, hands them to the
//! strategy, and turns every failure into a fallback to the source cluster.

use std::sync::Arc;

use meridian_core::{Node, NodePool, Pod, Topology, proxypod};
use meridian_placement::{ClusterObservations, ClusterScheduler, Observations};
use meridian_state::{Clusters, StateError};
use tracing::{debug, info, warn};

use crate::error::SchedulerResult;
use crate::pending::PendingDecisions;

pub struct SchedulerShim {
    clusters: Clusters,
    topology: Topology,
    pending: Arc<PendingDecisions>,
    strategy: Arc<dyn ClusterScheduler>,
}

impl SchedulerShim {
    pub fn new(
        clusters: Clusters,
        topology: Topology,
        pending: Arc<PendingDecisions>,
        strategy: Arc<dyn ClusterScheduler>,
    ) -> Self {
        Self {
            clusters,
            topology,
            pending,
            strategy,
        }
    }

    /// Target cluster for `proxy` of `source_cluster`, whose original spec
    /// is `source`. Never fails: errors and "nothing fits" both yield
    /// `source_cluster`.
    pub fn schedule(&self, source_cluster: &str, proxy: &Pod, source: &Pod) -> String {
        let pod = proxy.meta.table_key();
        let observations = match self.observe(source_cluster, proxy) {
            Ok(observations) => observations,
            Err(e) => {
                warn!(%pod, cluster = source_cluster, error = %e, "observing clusters failed, falling back to source cluster");
                return source_cluster.to_string();
            }
        };

        match self.strategy.schedule(source, &observations) {
            Ok(Some(target)) => {
                info!(%pod, source = source_cluster, %target, "cluster selected");
                target
            }
            Ok(None) => {
                warn!(%pod, cluster = source_cluster, "no cluster qualifies, falling back to source cluster");
                source_cluster.to_string()
            }
            Err(e) => {
                warn!(%pod, cluster = source_cluster, error = %e, "cluster scheduling failed, falling back to source cluster");
                source_cluster.to_string()
            }
        }
    }

    /// Observations of the clusters `proxy` may be placed onto, with the
    /// pending decisions of each merged in.
    fn observe(&self, source_cluster: &str, proxy: &Pod) -> SchedulerResult<Observations> {
        let namespace = &proxy.meta.namespace;
        let mut observations = Observations::new();

        for cluster in self
            .topology
            .eligible(source_cluster, proxypod::federation(proxy))
        {
            let store = self.clusters.get(&cluster)?;
            if !store.allows_namespace(namespace) {
                debug!(%cluster, %namespace, "cluster forbids namespace, skipping");
                continue;
            }

            let nodes = match store.list_all::<Node>() {
                Ok(nodes) => nodes,
                Err(StateError::Unavailable(_)) => {
                    warn!(%cluster, "cluster unreachable, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let node_pools = store.list_all::<NodePool>()?;
            let mut pods = store.list_all::<Pod>()?;
            pods.retain(|p| p.status.is_active());

            observations.insert(
                &cluster,
                ClusterObservations {
                    nodes,
                    node_pools,
                    pods,
                    pending: self.pending.for_cluster(&cluster),
                },
            );
        }
        Ok(observations)
    }
}
