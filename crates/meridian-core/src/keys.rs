//! Annotation, label and finalizer keys exchanged between clusters.
//!
//! Clusters never call each other's reconcilers; every protocol step is
//! expressed as one of these keys on a pod or chaperon record.

use std::collections::BTreeMap;

pub const KEY_PREFIX: &str = "multicluster.meridian.dev/";

// ── Proxy pod ──────────────────────────────────────────────────

/// Marks a pod for multi-cluster placement.
pub const ANNOTATION_ELECT: &str = "multicluster.meridian.dev/elect";
/// Target cluster chosen for a proxy pod.
pub const ANNOTATION_CLUSTER_NAME: &str = "multicluster.meridian.dev/cluster-name";
/// Serialized source pod, captured once at admission.
pub const ANNOTATION_SOURCE_POD_MANIFEST: &str = "multicluster.meridian.dev/sourcepod-manifest";
/// Restricts eligible targets to the members of a named federation.
pub const ANNOTATION_FEDERATION_NAME: &str = "multicluster.meridian.dev/federation-name";
/// Skips the reservation phase: the delegate is created right away.
pub const ANNOTATION_NO_RESERVATION: &str = "multicluster.meridian.dev/no-reservation";

// ── Chaperon ───────────────────────────────────────────────────

/// Value is the node the target cluster reserved.
pub const ANNOTATION_IS_RESERVED: &str = "multicluster.meridian.dev/is-reserved";
pub const ANNOTATION_IS_ALLOWED: &str = "multicluster.meridian.dev/is-allowed";
pub const ANNOTATION_IS_UNSCHEDULABLE: &str = "multicluster.meridian.dev/is-unschedulable";
pub const ANNOTATION_IS_BOUND: &str = "multicluster.meridian.dev/is-bound";
pub const ANNOTATION_BINDING_FAILED: &str = "multicluster.meridian.dev/binding-failed";
/// Epoch seconds at which a previously created delegate was found missing.
pub const ANNOTATION_POD_MISSING_SINCE: &str = "multicluster.meridian.dev/pod-missing-since";

// ── Labels ─────────────────────────────────────────────────────

pub const LABEL_PARENT_UID: &str = "multicluster.meridian.dev/parent-uid";
pub const LABEL_PARENT_NAME: &str = "multicluster.meridian.dev/parent-name";
pub const LABEL_PARENT_NAMESPACE: &str = "multicluster.meridian.dev/parent-namespace";
pub const LABEL_PARENT_CLUSTER_NAME: &str = "multicluster.meridian.dev/parent-cluster-name";
pub const LABEL_HAS_FINALIZER: &str = "multicluster.meridian.dev/has-finalizer";
pub const LABEL_NODE_POOL: &str = "multicluster.meridian.dev/nodepool";
pub const LABEL_GKE_NODE_POOL: &str = "cloud.google.com/gke-nodepool";
pub const LABEL_AKS_NODE_POOL: &str = "agentpool";
pub const DEFAULT_NODE_POOL: &str = "default";

pub const LABEL_VIRTUAL_KUBELET_PROVIDER: &str = "virtual-kubelet.io/provider";
pub const VIRTUAL_KUBELET_PROVIDER_NAME: &str = "meridian";

// ── Scheduling ─────────────────────────────────────────────────

pub const FINALIZER_FOREGROUND_DELETION: &str =
    "multicluster.meridian.dev/multiclusterForegroundDeletion";
pub const PROXY_SCHEDULER_NAME: &str = "meridian-proxy";
pub const CANDIDATE_SCHEDULER_NAME: &str = "meridian-candidate";

/// Whether a label or annotation key belongs to the placement protocol.
pub fn is_placement_key(key: &str) -> bool {
    key.starts_with(KEY_PREFIX)
}

/// Split labels or annotations into (placement-prefixed, everything else).
pub fn split_annotations(
    all: &BTreeMap<String, String>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    all.iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(k, _)| is_placement_key(k))
}
