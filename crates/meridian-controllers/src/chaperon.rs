//! Chaperon Reconciler: turns accepted chaperons into delegate pods.
//!
//! Runs in every target cluster. The delegate pod shares the chaperon's name
//! and is controlled by it. Once it exists, its status and user annotations
//! flow back onto the chaperon, where the Feedback Reconciler picks them up.

use std::future::Future;
use std::time::Duration;

use meridian_core::delegatepod::make_delegate_pod;
use meridian_core::keys::ANNOTATION_POD_MISSING_SINCE;
use meridian_core::{Chaperon, Kind, ObjectKey, Pod};
use meridian_reconcile::{ReconcileError, Reconciler};
use meridian_state::store::epoch_secs;
use meridian_state::{ClusterStore, Clusters, StateError, StoreEvent};
use tracing::{debug, info};

use crate::error::{ControllerError, ControllerResult};
use crate::mirror::MirrorKind;

pub struct ChaperonReconciler {
    clusters: Clusters,
    conflict_requeue: Duration,
}

impl ChaperonReconciler {
    pub fn new(clusters: Clusters, conflict_requeue: Duration) -> Self {
        Self {
            clusters,
            conflict_requeue,
        }
    }

    /// Chaperon keys touched by a store event: the chaperon itself, or the
    /// owner of a delegate pod.
    pub fn keys_for(event: &StoreEvent) -> Vec<ObjectKey> {
        match event.kind {
            Kind::Chaperon => vec![ObjectKey::of(&event.cluster, &event.meta)],
            Kind::Pod => event
                .meta
                .owner
                .iter()
                .filter(|o| o.kind == Kind::Chaperon)
                .map(|o| ObjectKey::new(&event.cluster, &event.meta.namespace, &o.name))
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Option<Duration>> {
        let store = self.clusters.get(&key.cluster)?;
        let chaperon = store.get::<Chaperon>(&key.namespace, &key.name)?;
        let pod = store.get::<Pod>(&key.namespace, &key.name)?;

        let Some(chaperon) = chaperon.filter(|c| !c.meta.is_terminating()) else {
            // Garbage-collect the delegate of a chaperon that is gone.
            if let Some(pod) = pod {
                if pod.meta.owner.as_ref().is_some_and(|o| o.kind == Kind::Chaperon) {
                    store.delete::<Pod>(&key.namespace, &key.name)?;
                    info!(%key, "orphaned delegate pod deleted");
                }
            }
            return Ok(None);
        };

        match pod {
            None => self.ensure_delegate(store, key, chaperon),
            Some(pod) => {
                if !pod.meta.is_controlled_by(Kind::Chaperon, &chaperon.meta) {
                    return Err(ControllerError::OwnershipConflict {
                        cluster: key.cluster.clone(),
                        kind: Kind::Pod,
                        key: pod.meta.table_key(),
                        owner: format!("chaperon {}", chaperon.meta.uid),
                    });
                }
                self.mirror(store, &pod, chaperon)?;
                Ok(None)
            }
        }
    }

    fn ensure_delegate(
        &self,
        store: &ClusterStore,
        key: &ObjectKey,
        mut chaperon: Chaperon,
    ) -> ControllerResult<Option<Duration>> {
        if chaperon.status.phase.is_some() {
            // The delegate existed (its status was mirrored) and vanished.
            if !chaperon.meta.has_annotation(ANNOTATION_POD_MISSING_SINCE) {
                chaperon.meta.annotations.insert(
                    ANNOTATION_POD_MISSING_SINCE.to_string(),
                    epoch_secs().to_string(),
                );
                store.update(&chaperon)?;
                info!(%key, "delegate pod missing");
            }
            return Ok(None);
        }
        if !chaperon.is_allowed() && !chaperon.is_no_reservation() {
            return Ok(None);
        }

        let delegate = make_delegate_pod(&chaperon);
        match store.create(&delegate) {
            Ok(_) => {
                info!(%key, node = delegate.spec.node_name.as_deref().unwrap_or(""), "delegate pod created");
                Ok(None)
            }
            // Created by a concurrent pass; the pod event brings us back.
            Err(StateError::AlreadyExists(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delegate status and user annotations onto the chaperon, as two
    /// separate equality-gated writes.
    fn mirror(&self, store: &ClusterStore, pod: &Pod, mut chaperon: Chaperon) -> ControllerResult<()> {
        let strategy = MirrorKind::Delegate;
        if strategy.status_needs_update(&pod.status, &chaperon.status) {
            chaperon.status = pod.status.clone();
            chaperon = store.update_status(&chaperon)?;
            debug!(chaperon = %chaperon.meta.table_key(), "status mirrored");
        }
        if strategy.annotations_need_update(&pod.meta.annotations, &chaperon.meta.annotations) {
            strategy.mutate_annotations(&pod.meta.annotations, &mut chaperon.meta.annotations);
            store.update(&chaperon)?;
            debug!(chaperon = %chaperon.meta.table_key(), "annotations mirrored");
        }
        Ok(())
    }
}

impl Reconciler for ChaperonReconciler {
    type Key = ObjectKey;
    type Error = ControllerError;

    fn handle(
        &self,
        key: &ObjectKey,
    ) -> impl Future<Output = Result<Option<Duration>, ControllerError>> + Send {
        async move {
            match self.reconcile(key).await {
                Err(e) if e.is_conflict() => {
                    debug!(%key, error = %e, "conflict, requeueing");
                    Ok(Some(self.conflict_requeue))
                }
                other => other,
            }
        }
    }
}
