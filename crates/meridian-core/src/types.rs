//! Record types persisted in every cluster store.
//!
//! All records share [`ObjectMeta`]; pods and chaperons additionally carry a
//! [`PodStatus`] that is written through the status subresource only.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::quantity::{self, ResourceList};

/// Condition type set by schedulers.
pub const CONDITION_POD_SCHEDULED: &str = "PodScheduled";
pub const REASON_UNSCHEDULABLE: &str = "Unschedulable";
pub const REASON_SCHEDULING_GATED: &str = "SchedulingGated";

/// Mount path of the service account token projected into every pod.
pub const SERVICE_ACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Record kinds held by a cluster store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Pod,
    Chaperon,
    Node,
    NodePool,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Pod => "Pod",
            Kind::Chaperon => "Chaperon",
            Kind::Node => "Node",
            Kind::NodePool => "NodePool",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller reference from a child record to its owner in the same cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: Kind,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    /// Empty for cluster-scoped records (nodes, node pools).
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub owner: Option<OwnerReference>,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub creation_timestamp: u64,
    #[serde(default)]
    pub deletion_timestamp: Option<u64>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    /// Store key: `{namespace}/{name}`, or `{name}` when cluster-scoped.
    pub fn table_key(&self) -> String {
        table_key(&self.namespace, &self.name)
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn has_annotation(&self, key: &str) -> bool {
        self.annotations.contains_key(key)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Whether `owner` is the controller of this record.
    pub fn is_controlled_by(&self, kind: Kind, owner: &ObjectMeta) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|o| o.kind == kind && o.name == owner.name && o.uid == owner.uid)
    }

    /// Whether every `(key, value)` of `selector` is present in the labels.
    pub fn matches(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|l| l == v))
    }
}

pub fn table_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// A record kind the stores know how to persist.
pub trait Object: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: Kind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Replace this record's status with `other`'s. No-op for kinds without status.
    fn set_status_from(&mut self, _other: &Self) {}
}

/// Reference to a namespaced record in a named cluster; the work-queue key of
/// every pod and chaperon reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(cluster: &str, namespace: &str, name: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn of(cluster: &str, meta: &ObjectMeta) -> Self {
        Self::new(cluster, &meta.namespace, &meta.name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.name)
    }
}

// ── Pods ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub limits: ResourceList,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    #[serde(default)]
    pub secret_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    pub key: String,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub effect: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub init_containers: Vec<Container>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub scheduler_name: Option<String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    /// Opaque affinity rules; only ever copied or cleared.
    #[serde(default)]
    pub affinity: Option<serde_json::Value>,
    #[serde(default)]
    pub topology_spread_constraints: Vec<serde_json::Value>,
    #[serde(default)]
    pub service_account_name: Option<String>,
    #[serde(default)]
    pub termination_grace_period_seconds: Option<i64>,
}

impl PodSpec {
    /// Sum of the container requests.
    pub fn resource_requests(&self) -> ResourceList {
        let mut total = ResourceList::new();
        for c in &self.containers {
            quantity::add_into(&mut total, &c.resources.requests);
        }
        total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    /// `None` until a kubelet-equivalent has reported on the pod.
    #[serde(default)]
    pub phase: Option<PodPhase>,
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl PodStatus {
    pub fn condition(&self, condition_type: &str) -> Option<&PodCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Insert or replace the condition of the same type.
    pub fn set_condition(&mut self, condition: PodCondition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }

    pub fn remove_condition(&mut self, condition_type: &str) -> bool {
        let before = self.conditions.len();
        self.conditions.retain(|c| c.condition_type != condition_type);
        before != self.conditions.len()
    }

    /// `PodScheduled=True`.
    pub fn is_scheduled(&self) -> bool {
        self.condition(CONDITION_POD_SCHEDULED)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// `PodScheduled=False` with reason `Unschedulable` or `SchedulingGated`.
    pub fn is_unschedulable(&self) -> bool {
        self.condition(CONDITION_POD_SCHEDULED).is_some_and(|c| {
            c.status == ConditionStatus::False
                && matches!(
                    c.reason.as_deref(),
                    Some(REASON_UNSCHEDULABLE) | Some(REASON_SCHEDULING_GATED)
                )
        })
    }

    /// Phases that still hold resources on a node.
    pub fn is_active(&self) -> bool {
        matches!(
            self.phase,
            None | Some(PodPhase::Pending) | Some(PodPhase::Running)
        )
    }
}

pub fn scheduled_condition() -> PodCondition {
    PodCondition {
        condition_type: CONDITION_POD_SCHEDULED.to_string(),
        status: ConditionStatus::True,
        reason: None,
        message: None,
    }
}

pub fn unschedulable_condition(message: &str) -> PodCondition {
    PodCondition {
        condition_type: CONDITION_POD_SCHEDULED.to_string(),
        status: ConditionStatus::False,
        reason: Some(REASON_UNSCHEDULABLE.to_string()),
        message: Some(message.to_string()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Object for Pod {
    const KIND: Kind = Kind::Pod;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn set_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

// ── Chaperons ──────────────────────────────────────────────────

/// Placeholder for a pod that intends to run in this cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chaperon {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Chaperon {
    /// Node the local scheduler reserved, if any.
    pub fn reserved_node(&self) -> Option<&str> {
        self.meta.annotation(crate::keys::ANNOTATION_IS_RESERVED)
    }

    pub fn is_reserved(&self) -> bool {
        self.meta.has_annotation(crate::keys::ANNOTATION_IS_RESERVED)
    }

    pub fn is_allowed(&self) -> bool {
        self.meta.has_annotation(crate::keys::ANNOTATION_IS_ALLOWED)
    }

    pub fn is_no_reservation(&self) -> bool {
        self.meta.has_annotation(crate::keys::ANNOTATION_NO_RESERVATION)
    }

    pub fn is_unschedulable(&self) -> bool {
        self.meta.has_annotation(crate::keys::ANNOTATION_IS_UNSCHEDULABLE)
            || self.status.is_unschedulable()
    }

    pub fn is_bound(&self) -> bool {
        self.meta.has_annotation(crate::keys::ANNOTATION_IS_BOUND) || self.status.is_scheduled()
    }

    pub fn binding_failed(&self) -> bool {
        self.meta.has_annotation(crate::keys::ANNOTATION_BINDING_FAILED)
    }
}

impl Object for Chaperon {
    const KIND: Kind = Kind::Chaperon;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn set_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

// ── Nodes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub allocatable: ResourceList,
    #[serde(default)]
    pub unschedulable: bool,
}

impl Node {
    /// Virtual nodes stand for whole target clusters.
    pub fn is_virtual(&self) -> bool {
        self.meta.label(crate::keys::LABEL_VIRTUAL_KUBELET_PROVIDER)
            == Some(crate::keys::VIRTUAL_KUBELET_PROVIDER_NAME)
    }

    pub fn pool(&self) -> &str {
        self.meta
            .label(crate::keys::LABEL_NODE_POOL)
            .unwrap_or(crate::keys::DEFAULT_NODE_POOL)
    }
}

impl Object for Node {
    const KIND: Kind = Kind::Node;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

/// A group of identical nodes that may grow up to `max_nodes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePool {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub min_nodes: u32,
    #[serde(default)]
    pub max_nodes: u32,
    /// Labels every node of the pool carries.
    #[serde(default)]
    pub node_labels: BTreeMap<String, String>,
    /// Allocatable capacity of one node of the pool.
    #[serde(default)]
    pub allocatable: ResourceList,
}

impl Object for NodePool {
    const KIND: Kind = Kind::NodePool;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_key_for_cluster_scoped() {
        assert_eq!(ObjectMeta::new("", "node-1").table_key(), "node-1");
        assert_eq!(ObjectMeta::new("ns1", "pod1").table_key(), "ns1/pod1");
    }

    #[test]
    fn selector_matching() {
        let mut meta = ObjectMeta::new("ns", "p");
        meta.labels.insert("app".into(), "web".into());
        let mut sel = BTreeMap::new();
        assert!(meta.matches(&sel));
        sel.insert("app".into(), "web".into());
        assert!(meta.matches(&sel));
        sel.insert("tier".into(), "front".into());
        assert!(!meta.matches(&sel));
    }

    #[test]
    fn unschedulable_requires_reason() {
        let mut status = PodStatus::default();
        assert!(!status.is_unschedulable());
        status.set_condition(PodCondition {
            condition_type: CONDITION_POD_SCHEDULED.into(),
            status: ConditionStatus::False,
            reason: Some("Preempted".into()),
            message: None,
        });
        assert!(!status.is_unschedulable());
        status.set_condition(unschedulable_condition("no nodes"));
        assert!(status.is_unschedulable());
        assert_eq!(status.conditions.len(), 1);
        status.set_condition(scheduled_condition());
        assert!(status.is_scheduled());
        assert!(status.remove_condition(CONDITION_POD_SCHEDULED));
        assert!(status.conditions.is_empty());
    }

    #[test]
    fn requests_sum_over_containers() {
        let mut spec = PodSpec::default();
        for cpu in ["250m", "500m"] {
            let mut c = Container::default();
            c.resources.requests.insert("cpu".into(), cpu.parse().unwrap());
            spec.containers.push(c);
        }
        assert_eq!(spec.resource_requests()["cpu"].millis(), 750);
    }

    #[test]
    fn controlled_by_checks_uid() {
        let mut owner = ObjectMeta::new("ns", "c");
        owner.uid = "u1".into();
        let mut child = ObjectMeta::new("ns", "c");
        child.owner = Some(OwnerReference {
            kind: Kind::Chaperon,
            name: "c".into(),
            uid: "u2".into(),
        });
        assert!(!child.is_controlled_by(Kind::Chaperon, &owner));
        owner.uid = "u2".into();
        assert!(child.is_controlled_by(Kind::Chaperon, &owner));
        assert!(!child.is_controlled_by(Kind::Pod, &owner));
    }
}
