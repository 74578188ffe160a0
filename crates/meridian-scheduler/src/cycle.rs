//! Proxy scheduling cycle: drive the candidate hooks for annotated proxy pods.
//!
//! For each proxy pod that has a target cluster but no node yet, try the
//! annotated target and then every other eligible cluster:
//! PreFilter → Filter → Reserve → PreBind → Bind → PostBind, rolling back
//! through Unreserve on the first failing step. Bind puts the proxy on the
//! virtual node of the target that accepted it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meridian_core::keys::ANNOTATION_CLUSTER_NAME;
use meridian_core::{
    CONDITION_POD_SCHEDULED, ObjectKey, Pod, proxypod, scheduled_condition,
    unschedulable_condition,
};
use meridian_reconcile::Reconciler;
use meridian_state::{ClusterStore, Clusters, StateError};
use tracing::{debug, info, warn};

use crate::candidate::{ProxyPlugin, Status};
use crate::error::{SchedulerError, SchedulerResult};

pub struct ProxyScheduler {
    clusters: Clusters,
    plugin: Arc<ProxyPlugin>,
}

fn reason(status: Status) -> String {
    match status {
        Status::Success => String::new(),
        Status::Unschedulable(r) | Status::UnschedulableAndUnresolvable(r) | Status::Error(r) => r,
    }
}

impl ProxyScheduler {
    pub fn new(clusters: Clusters, plugin: Arc<ProxyPlugin>) -> Self {
        Self { clusters, plugin }
    }

    async fn reconcile(&self, key: &ObjectKey) -> SchedulerResult<Option<Duration>> {
        let store = self.clusters.get(&key.cluster)?;
        let Some(pod) = store.get::<Pod>(&key.namespace, &key.name)? else {
            return Ok(None);
        };
        if !proxypod::is_proxy(&pod)
            || pod.meta.is_terminating()
            || proxypod::is_scheduled(&pod)
            || proxypod::target_cluster(&pod).is_none()
        {
            return Ok(None);
        }

        let source = key.cluster.as_str();
        let mut reasons = Vec::new();
        for target in self.plugin.candidate_targets(source, &pod) {
            match self.attempt(store, source, &pod, &target).await? {
                Ok(()) => return Ok(None),
                Err(why) => {
                    debug!(%key, %target, reason = %why, "target rejected");
                    reasons.push(format!("{target}: {why}"));
                }
            }
        }

        self.plugin.forget(&pod.meta.uid);
        let message = if reasons.is_empty() {
            "no eligible cluster".to_string()
        } else {
            reasons.join("; ")
        };
        warn!(%key, %message, "proxy pod unschedulable");
        self.mark_unschedulable(store, &pod, &message)?;
        Ok(Some(self.plugin.settings().retry_unschedulable))
    }

    /// One target, start to finish. `Ok(Err(reason))` is a clean rejection.
    async fn attempt(
        &self,
        store: &ClusterStore,
        source: &str,
        pod: &Pod,
        target: &str,
    ) -> SchedulerResult<Result<(), String>> {
        let status = self.plugin.pre_filter(pod, target);
        if !status.is_success() {
            return Ok(Err(reason(status)));
        }

        let status = self.plugin.filter(source, pod, target).await;
        if !status.is_success() {
            self.plugin.unreserve(source, pod, target);
            return Ok(Err(reason(status)));
        }

        let status = self.plugin.reserve(pod, target);
        if !status.is_success() {
            self.plugin.unreserve(source, pod, target);
            return Ok(Err(reason(status)));
        }

        let status = self.plugin.pre_bind(pod, target).await;
        if !status.is_success() {
            self.plugin.unreserve(source, pod, target);
            return Ok(Err(reason(status)));
        }

        match bind(store, pod, target) {
            Ok(bound) => {
                info!(pod = %bound.meta.table_key(), source, target, "proxy pod bound");
                self.plugin.post_bind(source, &bound, target);
                Ok(Ok(()))
            }
            Err(e) => {
                self.plugin.unreserve(source, pod, target);
                Err(e)
            }
        }
    }

    fn mark_unschedulable(&self, store: &ClusterStore, pod: &Pod, message: &str) -> SchedulerResult<()> {
        let Some(mut current) = store.get::<Pod>(&pod.meta.namespace, &pod.meta.name)? else {
            return Ok(());
        };
        let condition = unschedulable_condition(message);
        if current.status.condition(CONDITION_POD_SCHEDULED) == Some(&condition) {
            return Ok(());
        }
        current.status.set_condition(condition);
        match store.update_status(&current) {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() || e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

const BIND_ATTEMPTS: usize = 3;

/// Put the proxy on the target's virtual node and record the target it
/// actually landed on. Conflicts are retried; the last one is returned as the
/// store reported it.
fn bind(store: &ClusterStore, pod: &Pod, target: &str) -> SchedulerResult<Pod> {
    let (namespace, name) = (&pod.meta.namespace, &pod.meta.name);
    let mut attempt = 1;
    loop {
        let Some(mut current) = store.get::<Pod>(namespace, name)? else {
            return Err(StateError::NotFound(format!("Pod {}", pod.meta.table_key())).into());
        };
        if current.meta.uid != pod.meta.uid || current.meta.is_terminating() {
            return Err(StateError::NotFound(format!("Pod {}", pod.meta.table_key())).into());
        }
        current.spec.node_name = Some(proxypod::virtual_node_name(target));
        current
            .meta
            .annotations
            .insert(ANNOTATION_CLUSTER_NAME.to_string(), target.to_string());
        let mut bound = match store.update(&current) {
            Ok(bound) => bound,
            Err(e) if e.is_conflict() && attempt < BIND_ATTEMPTS => {
                attempt += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        bound.status.set_condition(scheduled_condition());
        return match store.update_status(&bound) {
            Ok(bound) => Ok(bound),
            // The binding stands; status catches up through feedback.
            Err(e) if e.is_conflict() => Ok(bound),
            Err(e) => Err(e.into()),
        };
    }
}

impl Reconciler for ProxyScheduler {
    type Key = ObjectKey;
    type Error = SchedulerError;

    fn handle(
        &self,
        key: &ObjectKey,
    ) -> impl Future<Output = Result<Option<Duration>, SchedulerError>> + Send {
        self.reconcile(key)
    }
}
