//! Feedback Reconciler: carries target-cluster state back to the proxy pod.
//!
//! Keyed by proxy pod in its source cluster. The proxy holds
//! [`FINALIZER_FOREGROUND_DELETION`] while it is live; deleting it moves it
//! through [`DeletionPhase::HasDependents`] (chaperons are deleted in every
//! target) to [`DeletionPhase::DependentsCleared`] (the finalizer is
//! released and the store removes the proxy).

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use meridian_core::keys::{
    ANNOTATION_CLUSTER_NAME, ANNOTATION_ELECT, ANNOTATION_POD_MISSING_SINCE,
    FINALIZER_FOREGROUND_DELETION, LABEL_PARENT_CLUSTER_NAME, LABEL_PARENT_NAME,
    LABEL_PARENT_NAMESPACE, LABEL_PARENT_UID,
};
use meridian_core::{
    CONDITION_POD_SCHEDULED, Chaperon, Kind, ObjectKey, Pod, PodPhase, Topology, proxypod,
};
use meridian_reconcile::{ReconcileError, Reconciler};
use meridian_state::{ClusterStore, Clusters, StoreEvent};
use tracing::{debug, info};

use crate::error::{ControllerError, ControllerResult};
use crate::mirror::MirrorKind;

/// Where a proxy pod stands with respect to its remote dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPhase {
    Live,
    /// Terminating; chaperons still exist in some target.
    HasDependents,
    /// Terminating; no chaperon is left, the finalizer may go.
    DependentsCleared,
}

impl DeletionPhase {
    pub fn of(proxy: &Pod, dependents: usize) -> Self {
        match (proxy.meta.is_terminating(), dependents) {
            (false, _) => DeletionPhase::Live,
            (true, 0) => DeletionPhase::DependentsCleared,
            (true, _) => DeletionPhase::HasDependents,
        }
    }
}

pub struct FeedbackReconciler {
    clusters: Clusters,
    topology: Topology,
    requeue: Duration,
}

impl FeedbackReconciler {
    pub fn new(clusters: Clusters, topology: Topology, requeue: Duration) -> Self {
        Self {
            clusters,
            topology,
            requeue,
        }
    }

    /// Proxy keys touched by a store event in any cluster.
    pub fn keys_for(&self, event: &StoreEvent) -> Vec<ObjectKey> {
        match event.kind {
            Kind::Pod if event.meta.has_annotation(ANNOTATION_ELECT) => {
                vec![ObjectKey::of(&event.cluster, &event.meta)]
            }
            Kind::Chaperon => {
                let meta = &event.meta;
                let (Some(name), Some(namespace)) = (
                    meta.label(LABEL_PARENT_NAME),
                    meta.label(LABEL_PARENT_NAMESPACE),
                ) else {
                    return Vec::new();
                };
                let sources = match meta.label(LABEL_PARENT_CLUSTER_NAME) {
                    Some(source) => vec![source.to_string()],
                    None => self.topology.sources_of(&event.cluster),
                };
                sources
                    .iter()
                    .map(|s| ObjectKey::new(s, namespace, name))
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Clusters that may hold a chaperon of `proxy`.
    fn targets(&self, source: &str, proxy: &Pod) -> Vec<String> {
        let mut targets = self.topology.targets_of(source);
        if let Some(annotated) = proxypod::target_cluster(proxy) {
            if !targets.iter().any(|t| t == annotated) {
                targets.push(annotated.to_string());
            }
        }
        targets
    }

    /// Chaperons of `proxy` per target, matched by the proxy uid.
    fn chaperons(&self, key: &ObjectKey, proxy: &Pod) -> ControllerResult<Vec<(String, Chaperon)>> {
        let selector = parent_selector(proxy);
        let mut found = Vec::new();
        for target in self.targets(&key.cluster, proxy) {
            let items = self
                .clusters
                .get(&target)?
                .list_namespaced::<Chaperon>(&key.namespace, &selector)?;
            if items.len() > 1 {
                return Err(ControllerError::MultipleCandidates {
                    cluster: target,
                    pod: proxy.meta.table_key(),
                    count: items.len(),
                });
            }
            found.extend(items.into_iter().map(|c| (target.clone(), c)));
        }
        Ok(found)
    }

    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Option<Duration>> {
        let source = self.clusters.get(&key.cluster)?;
        let Some(mut proxy) = source.get::<Pod>(&key.namespace, &key.name)? else {
            return Ok(None);
        };
        if !proxypod::is_proxy(&proxy) {
            return Ok(None);
        }

        let chaperons = self.chaperons(key, &proxy)?;
        match DeletionPhase::of(&proxy, chaperons.len()) {
            DeletionPhase::HasDependents => {
                for (target, c) in &chaperons {
                    self.delete_chaperon(target, c)?;
                }
                // Released on the next pass, once the deletions are visible.
                return Ok(Some(self.requeue));
            }
            DeletionPhase::DependentsCleared => {
                if proxy.meta.has_finalizer(FINALIZER_FOREGROUND_DELETION) {
                    proxy
                        .meta
                        .finalizers
                        .retain(|f| f != FINALIZER_FOREGROUND_DELETION);
                    source.update(&proxy)?;
                    info!(%key, "finalizer released");
                }
                return Ok(None);
            }
            DeletionPhase::Live => {}
        }

        if !proxy.meta.has_finalizer(FINALIZER_FOREGROUND_DELETION) {
            proxy
                .meta
                .finalizers
                .push(FINALIZER_FOREGROUND_DELETION.to_string());
            proxy = source.update(&proxy)?;
        }

        let scheduled = proxypod::is_scheduled(&proxy);
        let Some(target) = proxypod::target_cluster(&proxy).map(str::to_string) else {
            return Ok(None);
        };

        let mut active = None;
        for (cluster, c) in chaperons {
            if cluster == target {
                active = Some(c);
            } else if scheduled {
                self.delete_chaperon(&cluster, &c)?;
            }
        }
        if !scheduled {
            // Still in the candidate protocol.
            return Ok(None);
        }

        let target_store = self.clusters.get(&target)?;
        match active {
            Some(c) if c.meta.has_annotation(ANNOTATION_POD_MISSING_SINCE) => {
                self.delete_chaperon(&target, &c)?;
                self.unbind(source, proxy)?;
                info!(%key, %target, "delegate pod lost, proxy released for rescheduling");
            }
            Some(c) => self.sync(key, source, target_store, proxy, c)?,
            None => {
                let deleted = target_store.delete_collection::<Pod>(&key.namespace, &parent_selector(&proxy))?;
                if deleted > 0 {
                    info!(%key, %target, deleted, "orphaned delegate pods deleted");
                }
            }
        }
        Ok(None)
    }

    fn delete_chaperon(&self, cluster: &str, c: &Chaperon) -> ControllerResult<()> {
        if self
            .clusters
            .get(cluster)?
            .delete::<Chaperon>(&c.meta.namespace, &c.meta.name)?
        {
            debug!(cluster, chaperon = %c.meta.table_key(), "chaperon deleted");
        }
        Ok(())
    }

    /// Chaperon status and user annotations onto the proxy, then restamp the
    /// chaperon with its source cluster if that drifted.
    fn sync(
        &self,
        key: &ObjectKey,
        source: &ClusterStore,
        target: &ClusterStore,
        mut proxy: Pod,
        mut c: Chaperon,
    ) -> ControllerResult<()> {
        let strategy = MirrorKind::Feedback;
        if strategy.status_needs_update(&c.status, &proxy.status) {
            proxy.status = c.status.clone();
            proxy = source.update_status(&proxy)?;
            debug!(%key, "status fed back");
        }
        if strategy.annotations_need_update(&c.meta.annotations, &proxy.meta.annotations) {
            strategy.mutate_annotations(&c.meta.annotations, &mut proxy.meta.annotations);
            source.update(&proxy)?;
            debug!(%key, "annotations fed back");
        }
        if c.meta.label(LABEL_PARENT_CLUSTER_NAME) != Some(key.cluster.as_str()) {
            c.meta
                .labels
                .insert(LABEL_PARENT_CLUSTER_NAME.to_string(), key.cluster.clone());
            target.update(&c)?;
        }
        Ok(())
    }

    /// Clear the binding so the proxy goes through placement again.
    fn unbind(&self, source: &ClusterStore, mut proxy: Pod) -> ControllerResult<()> {
        proxy.spec.node_name = None;
        proxy.meta.annotations.remove(ANNOTATION_CLUSTER_NAME);
        let mut proxy = source.update(&proxy)?;
        proxy.status.remove_condition(CONDITION_POD_SCHEDULED);
        proxy.status.phase = Some(PodPhase::Pending);
        source.update_status(&proxy)?;
        Ok(())
    }
}

fn parent_selector(proxy: &Pod) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_PARENT_UID.to_string(), proxy.meta.uid.clone())])
}

impl Reconciler for FeedbackReconciler {
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
                    Ok(Some(self.requeue))
                }
                other => other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::delegatepod::{make_chaperon, make_delegate_pod};
    use meridian_core::keys::ANNOTATION_IS_ALLOWED;
    use meridian_core::{ObjectMeta, PodStatus};

    struct Fixture {
        clusters: Clusters,
        reconciler: FeedbackReconciler,
        proxy: Pod,
    }

    /// Proxy `ns1/pod1` in c1, scheduled to c2, with an allowed chaperon there.
    fn fixture() -> Fixture {
        let clusters = Clusters::in_memory(["c1", "c2", "c3"]).unwrap();
        let topology = Topology::new().with_cluster("c1", ["c2", "c3"]);
        let reconciler =
            FeedbackReconciler::new(clusters.clone(), topology, Duration::from_millis(10));

        let mut source = Pod {
            meta: ObjectMeta::new("ns1", "pod1"),
            ..Default::default()
        };
        source.meta.annotations.insert(ANNOTATION_ELECT.into(), String::new());
        source.meta.annotations.insert("team".into(), "infra".into());
        let mut proxy = proxypod::mutate(&source).unwrap();
        proxy
            .meta
            .annotations
            .insert(ANNOTATION_CLUSTER_NAME.into(), "c2".into());
        proxy.spec.node_name = Some(proxypod::virtual_node_name("c2"));
        let proxy = clusters.get("c1").unwrap().create(&proxy).unwrap();

        let mut c = make_chaperon(&proxy, "c1").unwrap();
        c.meta.annotations.insert(ANNOTATION_IS_ALLOWED.into(), String::new());
        clusters.get("c2").unwrap().create(&c).unwrap();

        Fixture {
            clusters,
            reconciler,
            proxy,
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::new("c1", "ns1", "pod1")
    }

    fn proxy(f: &Fixture) -> Pod {
        f.clusters.get("c1").unwrap().get("ns1", "pod1").unwrap().unwrap()
    }

    fn chaperon(f: &Fixture, cluster: &str) -> Option<Chaperon> {
        let name = meridian_core::delegatepod::chaperon_name(&f.proxy);
        f.clusters.get(cluster).unwrap().get("ns1", &name).unwrap()
    }

    fn set_chaperon_status(f: &Fixture, phase: PodPhase) {
        let store = f.clusters.get("c2").unwrap();
        let mut c = chaperon(f, "c2").unwrap();
        c.status = PodStatus {
            phase: Some(phase),
            ..Default::default()
        };
        store.update_status(&c).unwrap();
    }

    #[test]
    fn deletion_phases() {
        let mut pod = Pod::default();
        assert_eq!(DeletionPhase::of(&pod, 2), DeletionPhase::Live);
        pod.meta.deletion_timestamp = Some(1);
        assert_eq!(DeletionPhase::of(&pod, 2), DeletionPhase::HasDependents);
        assert_eq!(DeletionPhase::of(&pod, 0), DeletionPhase::DependentsCleared);
    }

    #[tokio::test]
    async fn adds_finalizer_and_feeds_status_back_once() {
        let f = fixture();
        set_chaperon_status(&f, PodPhase::Running);

        f.reconciler.handle(&key()).await.unwrap();
        let p = proxy(&f);
        assert!(p.meta.has_finalizer(FINALIZER_FOREGROUND_DELETION));
        assert_eq!(p.status.phase, Some(PodPhase::Running));

        let c1 = f.clusters.get("c1").unwrap();
        let c2 = f.clusters.get("c2").unwrap();
        let writes = (c1.writes(), c2.writes());
        f.reconciler.handle(&key()).await.unwrap();
        assert_eq!((c1.writes(), c2.writes()), writes);
    }

    #[tokio::test]
    async fn placement_annotations_alone_cause_no_update() {
        let f = fixture();
        f.reconciler.handle(&key()).await.unwrap();
        let c1 = f.clusters.get("c1").unwrap();
        let c2 = f.clusters.get("c2").unwrap();

        // The chaperon differs from the proxy only by placement keys.
        let before = c1.writes();
        f.reconciler.handle(&key()).await.unwrap();
        assert_eq!(c1.writes(), before);

        let mut c = chaperon(&f, "c2").unwrap();
        c.meta.annotations.insert("note".into(), "from-target".into());
        c2.update(&c).unwrap();

        let before = c1.writes();
        f.reconciler.handle(&key()).await.unwrap();
        assert_eq!(c1.writes(), before + 1);
        let p = proxy(&f);
        assert_eq!(p.meta.annotation("note"), Some("from-target"));
        assert_eq!(p.meta.annotation("team"), Some("infra"));
        assert_eq!(p.meta.annotation(ANNOTATION_CLUSTER_NAME), Some("c2"));
    }

    #[tokio::test]
    async fn deletes_chaperons_in_other_targets() {
        let f = fixture();
        let stray = make_chaperon(&f.proxy, "c1").unwrap();
        f.clusters.get("c3").unwrap().create(&stray).unwrap();

        f.reconciler.handle(&key()).await.unwrap();
        assert!(chaperon(&f, "c3").is_none());
        assert!(chaperon(&f, "c2").is_some());
    }

    #[tokio::test]
    async fn restamps_source_cluster() {
        let f = fixture();
        let c2 = f.clusters.get("c2").unwrap();
        let mut c = chaperon(&f, "c2").unwrap();
        c.meta.labels.remove(LABEL_PARENT_CLUSTER_NAME);
        c2.update(&c).unwrap();

        f.reconciler.handle(&key()).await.unwrap();
        let c = chaperon(&f, "c2").unwrap();
        assert_eq!(c.meta.label(LABEL_PARENT_CLUSTER_NAME), Some("c1"));
    }

    #[tokio::test]
    async fn missing_delegate_releases_proxy() {
        let f = fixture();
        let c2 = f.clusters.get("c2").unwrap();
        let mut c = chaperon(&f, "c2").unwrap();
        c.meta
            .annotations
            .insert(ANNOTATION_POD_MISSING_SINCE.into(), "1".into());
        c2.update(&c).unwrap();

        f.reconciler.handle(&key()).await.unwrap();
        assert!(chaperon(&f, "c2").is_none());
        let p = proxy(&f);
        assert!(p.spec.node_name.is_none());
        assert!(!p.meta.has_annotation(ANNOTATION_CLUSTER_NAME));
        assert!(!p.status.is_scheduled());
    }

    #[tokio::test]
    async fn orphaned_delegates_are_deleted() {
        let f = fixture();
        let c2 = f.clusters.get("c2").unwrap();
        let c = chaperon(&f, "c2").unwrap();
        c2.create(&make_delegate_pod(&c)).unwrap();
        c2.delete::<Chaperon>("ns1", &c.meta.name).unwrap();

        f.reconciler.handle(&key()).await.unwrap();
        assert!(c2.get::<Pod>("ns1", &c.meta.name).unwrap().is_none());
    }

    #[tokio::test]
    async fn finalizer_held_until_chaperons_are_gone() {
        let f = fixture();
        let c1 = f.clusters.get("c1").unwrap();
        f.reconciler.handle(&key()).await.unwrap();

        c1.delete::<Pod>("ns1", "pod1").unwrap();
        assert!(proxy(&f).meta.is_terminating());

        // First pass deletes dependents and keeps the finalizer.
        assert!(f.reconciler.handle(&key()).await.unwrap().is_some());
        assert!(chaperon(&f, "c2").is_none());
        assert!(proxy(&f).meta.has_finalizer(FINALIZER_FOREGROUND_DELETION));

        // Second pass releases it and the proxy disappears.
        assert_eq!(f.reconciler.handle(&key()).await.unwrap(), None);
        assert!(c1.get::<Pod>("ns1", "pod1").unwrap().is_none());
    }

    #[test]
    fn chaperon_events_map_to_proxy() {
        let f = fixture();
        let c = chaperon(&f, "c2").unwrap();
        let event = StoreEvent {
            cluster: "c2".into(),
            kind: Kind::Chaperon,
            action: meridian_state::EventAction::Modified,
            meta: c.meta.clone(),
        };
        assert_eq!(f.reconciler.keys_for(&event), vec![key()]);

        let mut unlabelled = c.meta;
        unlabelled.labels.remove(LABEL_PARENT_CLUSTER_NAME);
        let event = StoreEvent {
            meta: unlabelled,
            ..event
        };
        assert_eq!(f.reconciler.keys_for(&event), vec![key()]);
    }
}
