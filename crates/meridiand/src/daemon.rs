//! Controller wiring.
//!
//! Every controller gets one watch per cluster store, a periodic resync,
//! and waits for every store to report synced before its workers start.

use std::sync::Arc;
use std::time::Duration;

use meridian_controllers::{ChaperonReconciler, FeedbackReconciler, NodePoolReconciler, pool_of};
use meridian_core::config::{CandidateSettings, EngineSettings};
use meridian_core::keys::{ANNOTATION_ELECT, LABEL_PARENT_UID};
use meridian_core::{
    Chaperon, Kind, MeridianConfig, Node, Object, ObjectKey, Pod, Topology, proxypod,
};
use meridian_placement::BasicScheduler;
use meridian_reconcile::{Backoff, Controller, Reconciler};
use meridian_scheduler::{
    LocalKey, LocalScheduler, PendingDecisions, ProxyPlugin, ProxyScheduler, ScheduleReconciler,
    SchedulerShim,
};
use meridian_state::{ClusterStore, Clusters, StoreEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Resolved timings for every controller.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub engine: EngineSettings,
    pub candidate: CandidateSettings,
    pub resync: Duration,
}

impl Settings {
    pub fn from_config(config: &MeridianConfig) -> Self {
        Self {
            engine: config.engine(),
            candidate: config.candidate(),
            resync: Duration::from_secs(30),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff {
            base: self.engine.base_backoff,
            max: self.engine.max_backoff,
        }
    }
}

/// Start every controller. Returns the tasks to await after `shutdown` flips.
pub fn start(
    clusters: &Clusters,
    topology: &Topology,
    settings: &Settings,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let backoff = settings.backoff();

    // Placement decisions.
    let pending = Arc::new(PendingDecisions::new());
    let shim = SchedulerShim::new(
        clusters.clone(),
        topology.clone(),
        Arc::clone(&pending),
        Arc::new(BasicScheduler),
    );
    let schedule = Arc::new(ScheduleReconciler::new(
        clusters.clone(),
        shim,
        pending,
        settings.engine.conflict_requeue,
    ));
    let listed = clusters.clone();
    handles.extend(launch(
        Controller::new("schedule", schedule, backoff).with_resync(settings.resync, move || {
            all_pods(&listed, |_| true)
        }),
        clusters,
        settings,
        shutdown,
        |e: &StoreEvent| match e.kind {
            Kind::Pod => vec![ObjectKey::of(&e.cluster, &e.meta)],
            _ => Vec::new(),
        },
    ));

    // Candidate protocol, source side.
    let plugin = Arc::new(ProxyPlugin::new(
        clusters.clone(),
        topology.clone(),
        settings.candidate,
        shutdown.clone(),
    ));
    let cycle = Arc::new(ProxyScheduler::new(clusters.clone(), plugin));
    let listed = clusters.clone();
    handles.extend(launch(
        Controller::new("proxy-scheduler", cycle, backoff).with_resync(settings.resync, move || {
            all_pods(&listed, |p| proxypod::is_proxy(p) && !proxypod::is_scheduled(p))
        }),
        clusters,
        settings,
        shutdown,
        |e: &StoreEvent| match e.kind {
            Kind::Pod if e.meta.has_annotation(ANNOTATION_ELECT) => {
                vec![ObjectKey::of(&e.cluster, &e.meta)]
            }
            _ => Vec::new(),
        },
    ));

    // Candidate protocol, target side.
    let local = Arc::new(LocalScheduler::new(clusters.clone(), settings.candidate));
    let listed = clusters.clone();
    handles.extend(launch(
        Controller::new("candidate-scheduler", local, backoff).with_resync(settings.resync, move || {
            let mut keys: Vec<LocalKey> = all_chaperons(&listed)
                .into_iter()
                .map(LocalKey::Chaperon)
                .collect();
            keys.extend(
                all_pods(&listed, |p| p.meta.labels.contains_key(LABEL_PARENT_UID))
                    .into_iter()
                    .map(LocalKey::Pod),
            );
            keys
        }),
        clusters,
        settings,
        shutdown,
        |e: &StoreEvent| match e.kind {
            Kind::Chaperon => vec![LocalKey::Chaperon(ObjectKey::of(&e.cluster, &e.meta))],
            Kind::Pod if e.meta.labels.contains_key(LABEL_PARENT_UID) => {
                vec![LocalKey::Pod(ObjectKey::of(&e.cluster, &e.meta))]
            }
            _ => Vec::new(),
        },
    ));

    // Delegate pods.
    let chaperons = Arc::new(ChaperonReconciler::new(
        clusters.clone(),
        settings.engine.conflict_requeue,
    ));
    let listed = clusters.clone();
    handles.extend(launch(
        Controller::new("chaperon", chaperons, backoff)
            .with_resync(settings.resync, move || all_chaperons(&listed)),
        clusters,
        settings,
        shutdown,
        ChaperonReconciler::keys_for,
    ));

    // Feedback onto proxy pods.
    let feedback = Arc::new(FeedbackReconciler::new(
        clusters.clone(),
        topology.clone(),
        settings.engine.conflict_requeue,
    ));
    let listed = clusters.clone();
    let mapper = Arc::clone(&feedback);
    handles.extend(launch(
        Controller::new("feedback", feedback, backoff).with_resync(settings.resync, move || {
            all_pods(&listed, proxypod::is_proxy)
        }),
        clusters,
        settings,
        shutdown,
        move |e: &StoreEvent| mapper.keys_for(e),
    ));

    // Node pools.
    let pools = Arc::new(NodePoolReconciler::new(clusters.clone()));
    let pool_clusters = clusters.clone();
    handles.extend(launch(
        Controller::new("nodepool", pools, backoff).with_resync(settings.resync, move || {
            let mut keys = Vec::new();
            for store in pool_clusters.iter() {
                for node in self::listed::<Node>(store) {
                    let key = ObjectKey::new(store.cluster(), "", pool_of(&node.meta));
                    if !node.is_virtual() && !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
            keys
        }),
        clusters,
        settings,
        shutdown,
        NodePoolReconciler::keys_for,
    ));

    info!(clusters = clusters.len(), tasks = handles.len(), "controllers started");
    handles
}

/// Watch every store with `map` and run the controller.
fn launch<R, F>(
    controller: Controller<R>,
    clusters: &Clusters,
    settings: &Settings,
    shutdown: &watch::Receiver<bool>,
    map: F,
) -> Vec<JoinHandle<()>>
where
    R: Reconciler,
    F: Fn(&StoreEvent) -> Vec<R::Key> + Clone + Send + 'static,
{
    let controller = controller
        .with_workers(settings.engine.workers)
        .with_caches(clusters.synced());
    let mut handles: Vec<_> = clusters
        .iter()
        .map(|store| controller.watch(store.subscribe(), shutdown.clone(), map.clone()))
        .collect();
    handles.push(tokio::spawn(controller.run(shutdown.clone())));
    handles
}

/// Records for a resync pass. An unreadable store contributes nothing this
/// round; watch events and the next resync cover it.
fn listed<T: Object>(store: &ClusterStore) -> Vec<T> {
    match store.list_all::<T>() {
        Ok(items) => items,
        Err(e) => {
            warn!(cluster = store.cluster(), kind = ?T::KIND, error = %e, "resync list failed");
            Vec::new()
        }
    }
}

fn all_pods(clusters: &Clusters, keep: impl Fn(&Pod) -> bool) -> Vec<ObjectKey> {
    let mut keys = Vec::new();
    for store in clusters.iter() {
        for pod in listed::<Pod>(store) {
            if keep(&pod) {
                keys.push(ObjectKey::of(store.cluster(), &pod.meta));
            }
        }
    }
    keys
}

fn all_chaperons(clusters: &Clusters) -> Vec<ObjectKey> {
    let mut keys = Vec::new();
    for store in clusters.iter() {
        for c in listed::<Chaperon>(store) {
            keys.push(ObjectKey::of(store.cluster(), &c.meta));
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::ObjectMeta;

    fn make_pod(name: &str) -> Pod {
        Pod {
            meta: ObjectMeta::new("ns1", name),
            ..Default::default()
        }
    }

    #[test]
    fn resync_skips_unreachable_cluster() {
        let clusters = Clusters::in_memory(["c1", "c2"]).unwrap();
        clusters.get("c1").unwrap().create(&make_pod("a")).unwrap();
        clusters.get("c2").unwrap().create(&make_pod("b")).unwrap();
        clusters.get("c2").unwrap().set_reachable(false);

        let keys = all_pods(&clusters, |_| true);
        assert_eq!(keys, vec![ObjectKey::new("c1", "ns1", "a")]);
        assert!(all_chaperons(&clusters).is_empty());
    }
}
