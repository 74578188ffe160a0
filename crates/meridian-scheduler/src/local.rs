//! Target-side local scheduler for chaperons and candidate-scheduled pods.
//!
//! A chaperon is reserved on the best fitting node (`is-reserved=<node>`) or
//! rejected (`is-unschedulable` plus a `PodScheduled=False` condition). A
//! reservation waits for the source to allow it; once allowed it is bound,
//! and if the permission does not come within the permit window the
//! reservation becomes `binding-failed`. Pods created without a reservation
//! are bound to a node directly.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use meridian_core::config::CandidateSettings;
use meridian_core::keys::{
    ANNOTATION_BINDING_FAILED, ANNOTATION_IS_BOUND, ANNOTATION_IS_RESERVED,
    ANNOTATION_IS_UNSCHEDULABLE, CANDIDATE_SCHEDULER_NAME,
};
use meridian_core::{
    CONDITION_POD_SCHEDULED, Chaperon, Node, ObjectKey, Pod, PodSpec, scheduled_condition,
    unschedulable_condition,
};
use meridian_placement::{ScoringWeights, node_to_resources, pod_to_requirements, rank_nodes};
use meridian_reconcile::Reconciler;
use meridian_state::{ClusterStore, Clusters};
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// Work item of the local scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalKey {
    Chaperon(ObjectKey),
    Pod(ObjectKey),
}

impl fmt::Display for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalKey::Chaperon(key) => write!(f, "chaperon {key}"),
            LocalKey::Pod(key) => write!(f, "pod {key}"),
        }
    }
}

pub struct LocalScheduler {
    clusters: Clusters,
    settings: CandidateSettings,
    weights: ScoringWeights,
    /// When each outstanding reservation was made.
    reservations: Mutex<HashMap<ObjectKey, Instant>>,
    /// One fit-and-reserve at a time, so concurrent workers never overcommit a node.
    fit: tokio::sync::Mutex<()>,
}

impl LocalScheduler {
    pub fn new(clusters: Clusters, settings: CandidateSettings) -> Self {
        Self {
            clusters,
            settings,
            weights: ScoringWeights::default(),
            reservations: Mutex::new(HashMap::new()),
            fit: tokio::sync::Mutex::new(()),
        }
    }

    fn reservations(&self) -> MutexGuard<'_, HashMap<ObjectKey, Instant>> {
        self.reservations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Best node for `spec`, and how many nodes were considered.
    fn pick_node(&self, store: &ClusterStore, spec: &PodSpec) -> SchedulerResult<(Option<String>, usize)> {
        let nodes = store.list_all::<Node>()?;
        let pods = store.list_all::<Pod>()?;
        let chaperons = store.list_all::<Chaperon>()?;
        let resources: Vec<_> = nodes
            .iter()
            .filter(|n| !n.is_virtual())
            .map(|n| node_to_resources(n, &pods, &chaperons))
            .collect();
        let ranked = rank_nodes(&resources, &pod_to_requirements(spec), &self.weights);
        Ok((ranked.into_iter().next().map(|s| s.node_name), resources.len()))
    }

    async fn reconcile_chaperon(&self, key: &ObjectKey) -> SchedulerResult<Option<Duration>> {
        let store = self.clusters.get(&key.cluster)?;
        let Some(mut c) = store.get::<Chaperon>(&key.namespace, &key.name)? else {
            self.reservations().remove(key);
            return Ok(None);
        };
        if c.meta.is_terminating() || c.is_no_reservation() || c.is_bound() || c.binding_failed() {
            self.reservations().remove(key);
            return Ok(None);
        }

        if c.is_reserved() {
            if c.is_allowed() {
                self.bind_chaperon(store, c)?;
                self.reservations().remove(key);
                return Ok(None);
            }
            let since = *self
                .reservations()
                .entry(key.clone())
                .or_insert_with(Instant::now);
            let elapsed = since.elapsed();
            if elapsed < self.settings.permit_wait {
                return Ok(Some(self.settings.permit_wait - elapsed));
            }
            c.meta
                .annotations
                .insert(ANNOTATION_BINDING_FAILED.to_string(), String::new());
            store.update(&c)?;
            self.reservations().remove(key);
            warn!(%key, "reservation was not allowed in time");
            return Ok(None);
        }
        if c.is_unschedulable() {
            return Ok(None);
        }

        let _fit = self.fit.lock().await;
        let (node, considered) = self.pick_node(store, &c.spec)?;
        match node {
            Some(node) => {
                c.meta
                    .annotations
                    .insert(ANNOTATION_IS_RESERVED.to_string(), node.clone());
                store.update(&c)?;
                self.reservations().insert(key.clone(), Instant::now());
                debug!(%key, %node, "chaperon reserved");
                Ok(Some(self.settings.permit_wait))
            }
            None => {
                c.meta
                    .annotations
                    .insert(ANNOTATION_IS_UNSCHEDULABLE.to_string(), String::new());
                let mut rejected = store.update(&c)?;
                let condition =
                    unschedulable_condition(&format!("0/{considered} nodes are available"));
                if rejected.status.condition(CONDITION_POD_SCHEDULED) != Some(&condition) {
                    rejected.status.set_condition(condition);
                    store.update_status(&rejected)?;
                }
                info!(%key, considered, "chaperon unschedulable");
                Ok(None)
            }
        }
    }

    fn bind_chaperon(&self, store: &ClusterStore, mut c: Chaperon) -> SchedulerResult<()> {
        c.meta
            .annotations
            .insert(ANNOTATION_IS_BOUND.to_string(), String::new());
        let mut bound = store.update(&c)?;
        bound.status.set_condition(scheduled_condition());
        store.update_status(&bound)?;
        info!(chaperon = %bound.meta.table_key(), node = bound.reserved_node().unwrap_or_default(), "chaperon bound");
        Ok(())
    }

    async fn reconcile_pod(&self, key: &ObjectKey) -> SchedulerResult<Option<Duration>> {
        let store = self.clusters.get(&key.cluster)?;
        let Some(mut pod) = store.get::<Pod>(&key.namespace, &key.name)? else {
            return Ok(None);
        };
        if pod.spec.scheduler_name.as_deref() != Some(CANDIDATE_SCHEDULER_NAME)
            || pod.spec.node_name.is_some()
            || pod.meta.is_terminating()
            || !pod.status.is_active()
        {
            return Ok(None);
        }

        let _fit = self.fit.lock().await;
        let (node, considered) = self.pick_node(store, &pod.spec)?;
        match node {
            Some(node) => {
                pod.spec.node_name = Some(node.clone());
                let mut bound = store.update(&pod)?;
                bound.status.set_condition(scheduled_condition());
                store.update_status(&bound)?;
                info!(%key, %node, "pod bound");
                Ok(None)
            }
            None => {
                let condition =
                    unschedulable_condition(&format!("0/{considered} nodes are available"));
                if pod.status.condition(CONDITION_POD_SCHEDULED) != Some(&condition) {
                    pod.status.set_condition(condition);
                    store.update_status(&pod)?;
                }
                Ok(Some(self.settings.retry_unschedulable))
            }
        }
    }
}

impl Reconciler for LocalScheduler {
    type Key = LocalKey;
    type Error = SchedulerError;

    fn handle(
        &self,
        key: &LocalKey,
    ) -> impl Future<Output = Result<Option<Duration>, SchedulerError>> + Send {
        async move {
            match key {
                LocalKey::Chaperon(key) => self.reconcile_chaperon(key).await,
                LocalKey::Pod(key) => self.reconcile_pod(key).await,
            }
        }
    }
}
