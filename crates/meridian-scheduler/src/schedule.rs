//! Schedule Reconciler: decide a target cluster for every new proxy pod.
//!
//! Watches pods in every cluster. Proxy pods without a target get one, and
//! the decision is recorded in [`PendingDecisions`] until the target shows
//! the delegate pod. Every other pod event only prunes pending decisions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meridian_core::keys::{ANNOTATION_CLUSTER_NAME, LABEL_PARENT_NAME};
use meridian_core::{ObjectKey, Pod, proxypod};
use meridian_reconcile::Reconciler;
use meridian_state::Clusters;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{SchedulerError, SchedulerResult};
use crate::pending::PendingDecisions;
use crate::shim::SchedulerShim;

pub struct ScheduleReconciler {
    clusters: Clusters,
    shim: SchedulerShim,
    pending: Arc<PendingDecisions>,
    /// Serializes decide-and-record so concurrent workers never score
    /// against a table missing each other's decisions.
    decide: Mutex<()>,
    conflict_requeue: Duration,
}

impl ScheduleReconciler {
    pub fn new(
        clusters: Clusters,
        shim: SchedulerShim,
        pending: Arc<PendingDecisions>,
        conflict_requeue: Duration,
    ) -> Self {
        Self {
            clusters,
            shim,
            pending,
            decide: Mutex::new(()),
            conflict_requeue,
        }
    }

    pub fn pending(&self) -> &Arc<PendingDecisions> {
        &self.pending
    }

    async fn reconcile(&self, key: &ObjectKey) -> SchedulerResult<Option<Duration>> {
        let store = self.clusters.get(&key.cluster)?;
        let Some(pod) = store.get::<Pod>(&key.namespace, &key.name)? else {
            self.pending.remove(&key.cluster, &key.namespace, &key.name);
            self.pending
                .remove_by_source(&key.cluster, &key.namespace, &key.name, None);
            return Ok(None);
        };

        if !proxypod::is_proxy(&pod) {
            // A delegate showing up in its target supersedes the decision.
            let parent = pod.meta.label(LABEL_PARENT_NAME).unwrap_or(&pod.meta.name);
            if self
                .pending
                .remove(&key.cluster, &key.namespace, parent)
                .is_some()
            {
                debug!(%key, "pending decision observed");
            }
            return Ok(None);
        }

        if pod.meta.is_terminating() || !pod.status.is_active() {
            self.pending
                .remove_by_source(&key.cluster, &key.namespace, &key.name, None);
            return Ok(None);
        }
        if proxypod::is_scheduled(&pod) {
            // Decisions for targets the proxy did not end up on are stale.
            self.pending.remove_by_source(
                &key.cluster,
                &key.namespace,
                &key.name,
                proxypod::target_cluster(&pod),
            );
            return Ok(None);
        }
        if proxypod::target_cluster(&pod).is_some() {
            return Ok(None);
        }

        let _guard = self.decide.lock().await;

        let mut source = proxypod::source_pod(&pod)?;
        source.meta.namespace = pod.meta.namespace.clone();
        source.meta.name = pod.meta.name.clone();

        let target = self.shim.schedule(&key.cluster, &pod, &source);
        self.pending.insert(&target, &key.cluster, source);

        let mut annotated = pod.clone();
        annotated
            .meta
            .annotations
            .insert(ANNOTATION_CLUSTER_NAME.to_string(), target.clone());

        match store.update(&annotated) {
            Ok(_) => {
                info!(%key, %target, "target cluster recorded");
                Ok(None)
            }
            Err(e) => {
                self.pending.remove(&target, &key.namespace, &key.name);
                if e.is_conflict() {
                    debug!(%key, "proxy pod changed while scheduling, retrying");
                    Ok(Some(self.conflict_requeue))
                } else if e.is_not_found() {
                    Ok(None)
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

impl Reconciler for ScheduleReconciler {
    type Key = ObjectKey;
    type Error = SchedulerError;

    fn handle(
        &self,
        key: &ObjectKey,
    ) -> impl Future<Output = Result<Option<Duration>, SchedulerError>> + Send {
        self.reconcile(key)
    }
}
