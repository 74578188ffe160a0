//! Candidate reservation hooks, run by the proxy scheduling cycle against
//! one target cluster at a time.
//!
//! ```text
//! NoCandidate ──filter──▶ CandidateCreated ──(target reserves)──▶ Reserved
//!                              │                                     │
//!                   unschedulable / timeout                       reserve
//!                              ▼                                     ▼
//!                   Rejected / TimedOut ◀──unreserve── ... ◀──── Allowed
//! ```
//!
//! Every wait is bounded and fails closed: a timeout, a shutdown or a store
//! error makes the candidate unschedulable for this cycle, never reserved.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use meridian_core::config::CandidateSettings;
use meridian_core::keys::{
    ANNOTATION_BINDING_FAILED, ANNOTATION_IS_ALLOWED, ANNOTATION_IS_RESERVED,
    ANNOTATION_IS_UNSCHEDULABLE, LABEL_PARENT_UID,
};
use meridian_core::{CONDITION_POD_SCHEDULED, Chaperon, Pod, Topology, delegatepod, proxypod};
use meridian_state::{ClusterStore, Clusters, StateError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// Outcome of one hook, in the terms of the host scheduling framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Success,
    /// May succeed on another attempt.
    Unschedulable(String),
    /// Will not succeed in this cycle.
    UnschedulableAndUnresolvable(String),
    Error(String),
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    fn from_error(e: SchedulerError) -> Status {
        match e {
            SchedulerError::State(StateError::Unavailable(cluster)) => {
                Status::UnschedulableAndUnresolvable(format!("cluster {cluster} unreachable"))
            }
            SchedulerError::State(e @ StateError::Forbidden { .. }) => {
                Status::UnschedulableAndUnresolvable(e.to_string())
            }
            e => Status::Error(e.to_string()),
        }
    }
}

/// What a Filter poll found.
enum Probe {
    Reserved,
    Rejected(String),
}

/// What a PreBind poll found.
enum Binding {
    Bound,
    Failed,
    Missing,
}

pub struct ProxyPlugin {
    clusters: Clusters,
    topology: Topology,
    settings: CandidateSettings,
    /// Pod uid → targets that already failed in the current attempt cycle.
    failed: Mutex<HashMap<String, BTreeSet<String>>>,
    shutdown: watch::Receiver<bool>,
}

fn parent_selector(pod: &Pod) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_PARENT_UID.to_string(), pod.meta.uid.clone())])
}

/// The chaperon of `pod` in `store`, if any. More than one is an invariant
/// violation.
fn candidate(store: &ClusterStore, pod: &Pod) -> SchedulerResult<Option<Chaperon>> {
    let mut found = store.list_namespaced::<Chaperon>(&pod.meta.namespace, &parent_selector(pod))?;
    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        count => Err(SchedulerError::MultipleCandidates {
            cluster: store.cluster().to_string(),
            pod: pod.meta.table_key(),
            count,
        }),
    }
}

impl ProxyPlugin {
    pub fn new(
        clusters: Clusters,
        topology: Topology,
        settings: CandidateSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            clusters,
            topology,
            settings,
            failed: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn settings(&self) -> &CandidateSettings {
        &self.settings
    }

    fn failed(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        self.failed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn has_failed(&self, pod_uid: &str, target: &str) -> bool {
        self.failed()
            .get(pod_uid)
            .is_some_and(|targets| targets.contains(target))
    }

    /// Drop the failure memory of a pod.
    pub fn forget(&self, pod_uid: &str) {
        self.failed().remove(pod_uid);
    }

    /// Targets to try for `pod` of `source`: the annotated target first, then
    /// the other eligible clusters in name order.
    pub fn candidate_targets(&self, source: &str, pod: &Pod) -> Vec<String> {
        let mut targets = Vec::new();
        if let Some(annotated) = proxypod::target_cluster(pod) {
            targets.push(annotated.to_string());
        }
        for cluster in self.topology.eligible(source, proxypod::federation(pod)) {
            if !targets.contains(&cluster) {
                targets.push(cluster);
            }
        }
        targets
    }

    pub fn get_candidate(&self, pod: &Pod, target: &str) -> SchedulerResult<Option<Chaperon>> {
        candidate(self.clusters.get(target)?, pod)
    }

    /// Poll `check` every poll interval until it yields, `wait` elapses or
    /// shutdown is signalled. `None` means no answer in time.
    async fn poll<T>(
        &self,
        wait: Duration,
        mut check: impl FnMut() -> SchedulerResult<Option<T>>,
    ) -> SchedulerResult<Option<T>> {
        let deadline = Instant::now() + wait;
        let mut shutdown = self.shutdown.clone();
        loop {
            if let Some(found) = check()? {
                return Ok(Some(found));
            }
            let stopping = *shutdown.borrow_and_update();
            let now = Instant::now();
            if stopping || now >= deadline {
                return Ok(None);
            }
            let next = (now + self.settings.poll_interval).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep_until(next).await;
                    }
                }
            }
        }
    }

    // ── PreFilter ──────────────────────────────────────────────────

    /// Fail fast on a target that already failed, and clear stale verdicts
    /// from a previous attempt so the target decides afresh.
    pub fn pre_filter(&self, pod: &Pod, target: &str) -> Status {
        if self.has_failed(&pod.meta.uid, target) {
            return Status::UnschedulableAndUnresolvable(format!(
                "cluster {target} already failed in this cycle"
            ));
        }
        match self.reset_stale(pod, target) {
            Ok(()) => Status::Success,
            Err(e) => Status::from_error(e),
        }
    }

    fn reset_stale(&self, pod: &Pod, target: &str) -> SchedulerResult<()> {
        let store = self.clusters.get(target)?;
        let Some(mut c) = candidate(store, pod)? else {
            return Ok(());
        };
        if c.is_allowed() {
            return Ok(());
        }

        let mut changed = false;
        for key in [
            ANNOTATION_IS_RESERVED,
            ANNOTATION_IS_UNSCHEDULABLE,
            ANNOTATION_BINDING_FAILED,
        ] {
            changed |= c.meta.annotations.remove(key).is_some();
        }
        if changed {
            c = store.update(&c)?;
            debug!(cluster = target, chaperon = %c.meta.table_key(), "stale verdict cleared");
        }
        if c.status.is_unschedulable() {
            c.status.remove_condition(CONDITION_POD_SCHEDULED);
            store.update_status(&c)?;
        }
        Ok(())
    }

    // ── Filter ─────────────────────────────────────────────────────

    /// Make sure a chaperon exists in `target`, then wait for the target's
    /// verdict on it.
    pub async fn filter(&self, source: &str, pod: &Pod, target: &str) -> Status {
        let store = match self.clusters.get(target) {
            Ok(store) => store,
            Err(e) => return Status::UnschedulableAndUnresolvable(e.to_string()),
        };

        let outcome = self
            .poll(self.settings.filter_wait, || self.probe(source, pod, store))
            .await;
        match outcome {
            Ok(Some(Probe::Reserved)) => Status::Success,
            Ok(Some(Probe::Rejected(reason))) => Status::UnschedulableAndUnresolvable(reason),
            Ok(None) => Status::UnschedulableAndUnresolvable(format!(
                "cluster {target} gave no verdict in time"
            )),
            Err(e) => Status::UnschedulableAndUnresolvable(e.to_string()),
        }
    }

    fn probe(&self, source: &str, pod: &Pod, store: &ClusterStore) -> SchedulerResult<Option<Probe>> {
        let Some(c) = candidate(store, pod)? else {
            let chaperon = delegatepod::make_chaperon(pod, source)?;
            match store.create(&chaperon) {
                Ok(created) => {
                    debug!(cluster = store.cluster(), chaperon = %created.meta.table_key(), "candidate created");
                }
                Err(StateError::AlreadyExists(_)) => {}
                Err(e @ StateError::Forbidden { .. }) => {
                    return Ok(Some(Probe::Rejected(e.to_string())));
                }
                Err(e) => return Err(e.into()),
            }
            return Ok(None);
        };

        if c.is_unschedulable() {
            return Ok(Some(Probe::Rejected(format!(
                "candidate unschedulable in cluster {}",
                store.cluster()
            ))));
        }
        let decided = if c.is_no_reservation() {
            c.is_bound()
        } else {
            c.is_reserved() || c.is_allowed()
        };
        Ok(decided.then_some(Probe::Reserved))
    }

    // ── Reserve ────────────────────────────────────────────────────

    /// Commit to `target` by allowing its candidate. A candidate that is
    /// already gone was resolved out of band; nothing is left to do.
    pub fn reserve(&self, pod: &Pod, target: &str) -> Status {
        let store = match self.clusters.get(target) {
            Ok(store) => store,
            Err(e) => return Status::Error(e.to_string()),
        };
        for _ in 0..3 {
            let mut c = match candidate(store, pod) {
                Ok(Some(c)) => c,
                Ok(None) => {
                    debug!(cluster = target, pod = %pod.meta.table_key(), "candidate gone, treating as final");
                    return Status::Success;
                }
                Err(e) => return Status::from_error(e),
            };
            if c.is_allowed() {
                return Status::Success;
            }
            c.meta
                .annotations
                .insert(ANNOTATION_IS_ALLOWED.to_string(), String::new());
            match store.update(&c) {
                Ok(_) => return Status::Success,
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Status::from_error(e.into()),
            }
        }
        Status::Error(format!("candidate in cluster {target} kept changing"))
    }

    // ── Unreserve ──────────────────────────────────────────────────

    /// Roll `target` back: remember the failure and remove its candidate.
    /// Once every target has failed the memory is cleared so the next cycle
    /// tries them all again.
    pub fn unreserve(&self, source: &str, pod: &Pod, target: &str) {
        let uid = pod.meta.uid.clone();
        self.failed()
            .entry(uid.clone())
            .or_default()
            .insert(target.to_string());

        match self.clusters.get(target).and_then(|store| {
            store.delete_collection::<Chaperon>(&pod.meta.namespace, &parent_selector(pod))
        }) {
            Ok(deleted) => {
                debug!(cluster = target, pod = %pod.meta.table_key(), deleted, "candidate rolled back");
            }
            Err(e) => {
                warn!(cluster = target, pod = %pod.meta.table_key(), error = %e, "candidate rollback failed");
            }
        }

        let targets = self.candidate_targets(source, pod);
        let mut failed = self.failed();
        let all_failed = failed
            .get(&uid)
            .is_some_and(|f| targets.iter().all(|t| f.contains(t)));
        if all_failed {
            failed.remove(&uid);
            debug!(pod = %pod.meta.table_key(), "every target failed, failure memory cleared");
        }
    }

    // ── PreBind ────────────────────────────────────────────────────

    /// Wait until the target actually bound the candidate.
    pub async fn pre_bind(&self, pod: &Pod, target: &str) -> Status {
        let store = match self.clusters.get(target) {
            Ok(store) => store,
            Err(e) => return Status::Error(e.to_string()),
        };

        let outcome = self
            .poll(self.settings.pre_bind_wait, || {
                Ok(match candidate(store, pod)? {
                    None => Some(Binding::Missing),
                    Some(c) if c.binding_failed() => Some(Binding::Failed),
                    Some(c) if c.is_bound() => Some(Binding::Bound),
                    Some(_) => None,
                })
            })
            .await;
        match outcome {
            Ok(Some(Binding::Bound)) => Status::Success,
            Ok(Some(Binding::Failed)) => Status::Unschedulable("candidate binding failed".to_string()),
            Ok(Some(Binding::Missing)) => Status::Error(format!("candidate not found in cluster {target}")),
            Ok(None) => Status::UnschedulableAndUnresolvable(format!(
                "cluster {target} did not bind in time"
            )),
            Err(e) => Status::from_error(e),
        }
    }

    // ── PostBind ───────────────────────────────────────────────────

    /// Remove candidates left in every other target and forget failures.
    pub fn post_bind(&self, source: &str, pod: &Pod, target: &str) {
        for other in self.candidate_targets(source, pod) {
            if other == target {
                continue;
            }
            match self.clusters.get(&other).and_then(|store| {
                store.delete_collection::<Chaperon>(&pod.meta.namespace, &parent_selector(pod))
            }) {
                Ok(0) => {}
                Ok(deleted) => {
                    info!(cluster = %other, pod = %pod.meta.table_key(), deleted, "leftover candidates removed");
                }
                Err(e) => {
                    warn!(cluster = %other, pod = %pod.meta.table_key(), error = %e, "leftover candidate cleanup failed");
                }
            }
        }
        self.forget(&pod.meta.uid);
    }
}
