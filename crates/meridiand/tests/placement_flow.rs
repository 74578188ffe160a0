//! End-to-end placement across in-memory clusters with short timings.

use std::time::Duration;

use meridian_core::config::{CandidateSettings, EngineSettings};
use meridian_core::keys::{ANNOTATION_CLUSTER_NAME, ANNOTATION_ELECT};
use meridian_core::{
    Chaperon, Container, MeridianConfig, ObjectMeta, Pod, PodPhase, Quantity, ResourceList,
    proxypod,
};
use meridian_state::Clusters;
use meridiand::Settings;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn settings() -> Settings {
    Settings {
        engine: EngineSettings {
            workers: 2,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(200),
            conflict_requeue: Duration::from_millis(20),
        },
        candidate: CandidateSettings {
            poll_interval: Duration::from_millis(5),
            filter_wait: Duration::from_secs(2),
            pre_bind_wait: Duration::from_secs(3),
            permit_wait: Duration::from_secs(2),
            retry_unschedulable: Duration::from_millis(100),
        },
        resync: Duration::from_millis(200),
    }
}

struct Harness {
    clusters: Clusters,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Harness {
    fn start(config: &str) -> Self {
        let config: MeridianConfig = toml::from_str(config).unwrap();
        config.validate().unwrap();
        let clusters = meridiand::open_clusters(&config).unwrap();
        meridiand::seed(&config, &clusters).unwrap();
        let (shutdown, rx) = watch::channel(false);
        let handles = meridiand::start(&clusters, &config.topology(), &settings(), &rx);
        clusters.mark_synced();
        Self {
            clusters,
            shutdown,
            handles,
        }
    }

    fn proxy(&self) -> Option<Pod> {
        self.clusters.get("c1").unwrap().get("ns1", "pod1").unwrap()
    }

    fn chaperons(&self, cluster: &str) -> Vec<Chaperon> {
        self.clusters.get(cluster).unwrap().list_all().unwrap()
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}

fn make_pod(cpu: i64) -> Pod {
    let mut requests = ResourceList::new();
    requests.insert("cpu".into(), Quantity::from_units(cpu));
    let mut container = Container {
        name: "main".into(),
        image: "nginx".into(),
        ..Default::default()
    };
    container.resources.requests = requests;

    let mut pod = Pod {
        meta: ObjectMeta::new("ns1", "pod1"),
        ..Default::default()
    };
    pod.meta.annotations.insert(ANNOTATION_ELECT.into(), String::new());
    pod.spec.containers.push(container);
    pod
}

/// Poll `check` until it holds or `timeout` elapses.
async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

const PAIR: &str = r#"
[[clusters]]
name = "c1"
targets = ["c2"]
target_self = false

[[clusters]]
name = "c2"
target_self = false

[[clusters.nodes]]
name = "n1"
allocatable = { cpu = "4", memory = "8Gi" }
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pod_is_placed_and_status_flows_back() {
    let h = Harness::start(PAIR);
    meridiand::submit(h.clusters.get("c1").unwrap(), &make_pod(1)).unwrap();

    let virtual_node = proxypod::virtual_node_name("c2");
    assert!(
        eventually(Duration::from_secs(10), || {
            h.proxy()
                .is_some_and(|p| p.spec.node_name.as_deref() == Some(virtual_node.as_str()))
        })
        .await
    );
    let proxy = h.proxy().unwrap();
    assert_eq!(proxy.meta.annotation(ANNOTATION_CLUSTER_NAME), Some("c2"));

    let chaperons = h.chaperons("c2");
    assert_eq!(chaperons.len(), 1);
    let c = &chaperons[0];
    assert!(c.is_allowed() && c.is_bound());

    let c2 = h.clusters.get("c2").unwrap();
    assert!(eventually(Duration::from_secs(5), || c2.get::<Pod>("ns1", &c.meta.name).unwrap().is_some()).await);
    let delegate: Pod = c2.get("ns1", &c.meta.name).unwrap().unwrap();
    assert_eq!(delegate.spec.node_name.as_deref(), Some("n1"));

    // The target cluster's kubelet reports the pod running.
    assert!(
        eventually(Duration::from_secs(5), || {
            let mut delegate: Pod = c2.get("ns1", &c.meta.name).unwrap().unwrap();
            delegate.status.phase = Some(PodPhase::Running);
            c2.update_status(&delegate).is_ok()
        })
        .await
    );
    assert!(
        eventually(Duration::from_secs(5), || {
            h.proxy().is_some_and(|p| p.status.phase == Some(PodPhase::Running))
        })
        .await
    );

    h.stop().await;
}

const FAILOVER: &str = r#"
[[clusters]]
name = "c1"
targets = ["c2", "c3"]
target_self = false

# Plenty of autoscaling headroom but no node yet: ranked first, then rejected
# by its own scheduler.
[[clusters]]
name = "c2"
target_self = false

[[clusters.node_pools]]
name = "burst"
min_nodes = 0
max_nodes = 5
allocatable = { cpu = "4" }

[[clusters]]
name = "c3"
target_self = false

[[clusters.nodes]]
name = "n1"
allocatable = { cpu = "2" }
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_target_is_rolled_back() {
    let h = Harness::start(FAILOVER);
    meridiand::submit(h.clusters.get("c1").unwrap(), &make_pod(1)).unwrap();

    let virtual_node = proxypod::virtual_node_name("c3");
    let mut max_allowed = 0;
    let placed = eventually(Duration::from_secs(10), || {
        let allowed = ["c2", "c3"]
            .iter()
            .flat_map(|c| h.chaperons(c))
            .filter(|c| c.is_allowed())
            .count();
        max_allowed = max_allowed.max(allowed);
        h.proxy()
            .is_some_and(|p| p.spec.node_name.as_deref() == Some(virtual_node.as_str()))
    })
    .await;
    assert!(placed);
    assert!(max_allowed <= 1);

    let proxy = h.proxy().unwrap();
    assert_eq!(proxy.meta.annotation(ANNOTATION_CLUSTER_NAME), Some("c3"));
    assert!(h.chaperons("c2").is_empty());
    assert_eq!(h.chaperons("c3").len(), 1);

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deleting_proxy_removes_remote_pods_first() {
    let h = Harness::start(PAIR);
    let c1 = h.clusters.get("c1").unwrap();
    let c2 = h.clusters.get("c2").unwrap();
    meridiand::submit(c1, &make_pod(1)).unwrap();

    assert!(
        eventually(Duration::from_secs(10), || {
            !c2.list_all::<Pod>().unwrap().is_empty()
                && h.proxy().is_some_and(|p| !p.meta.finalizers.is_empty())
        })
        .await
    );

    c1.delete::<Pod>("ns1", "pod1").unwrap();
    assert!(
        eventually(Duration::from_secs(10), || {
            h.proxy().is_none()
                && h.chaperons("c2").is_empty()
                && c2.list_all::<Pod>().unwrap().is_empty()
        })
        .await
    );

    h.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_delegate_pod_is_placed_again() {
    let h = Harness::start(PAIR);
    let c2 = h.clusters.get("c2").unwrap();
    meridiand::submit(h.clusters.get("c1").unwrap(), &make_pod(1)).unwrap();

    let virtual_node = proxypod::virtual_node_name("c2");
    let placed = || {
        h.proxy()
            .is_some_and(|p| p.spec.node_name.as_deref() == Some(virtual_node.as_str()))
    };
    assert!(eventually(Duration::from_secs(10), &placed).await);
    let first = h.chaperons("c2").remove(0);
    assert!(eventually(Duration::from_secs(5), || c2.get::<Pod>("ns1", &first.meta.name).unwrap().is_some()).await);

    // The delegate ran, and its phase reached the chaperon.
    assert!(
        eventually(Duration::from_secs(5), || {
            let mut delegate: Pod = c2.get("ns1", &first.meta.name).unwrap().unwrap();
            delegate.status.phase = Some(PodPhase::Running);
            c2.update_status(&delegate).is_ok()
        })
        .await
    );
    assert!(
        eventually(Duration::from_secs(5), || {
            h.chaperons("c2")
                .iter()
                .any(|c| c.status.phase == Some(PodPhase::Running))
        })
        .await
    );

    // Then the target cluster loses it.
    assert!(c2.delete::<Pod>("ns1", &first.meta.name).unwrap());

    assert!(
        eventually(Duration::from_secs(15), || {
            let chaperons = h.chaperons("c2");
            placed()
                && chaperons.len() == 1
                && chaperons[0].meta.uid != first.meta.uid
                && chaperons[0].is_bound()
                && c2
                    .get::<Pod>("ns1", &chaperons[0].meta.name)
                    .unwrap()
                    .is_some_and(|d| d.meta.owner.as_ref().is_some_and(|o| o.uid == chaperons[0].meta.uid))
        })
        .await
    );

    h.stop().await;
}
