//! Derivation of chaperons and delegate pods from a proxy pod.

use crate::error::CoreResult;
use crate::keys::*;
use crate::naming;
use crate::proxypod;
use crate::types::{
    Chaperon, Kind, ObjectMeta, OwnerReference, Pod, PodPhase, PodSpec, PodStatus,
    SERVICE_ACCOUNT_MOUNT_PATH, scheduled_condition,
};

/// Name of every chaperon (and delegate pod) derived from `proxy`.
///
/// Suffixed with a hash of the proxy uid so a cluster that targets itself
/// never collides with the proxy pod.
pub fn chaperon_name(proxy: &Pod) -> String {
    naming::suffixed(naming::LONG, &proxy.meta.name, &proxy.meta.uid)
}

/// Build the chaperon a target cluster receives for `proxy`.
///
/// Only user annotations survive; label keys are moved under the placement
/// prefix so controllers of the proxy pod do not adopt the delegate.
pub fn make_chaperon(proxy: &Pod, source_cluster: &str) -> CoreResult<Chaperon> {
    let source = proxypod::source_pod(proxy)?;

    let annotations = source
        .meta
        .annotations
        .iter()
        .filter(|(k, _)| !is_placement_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut labels: std::collections::BTreeMap<String, String> = source
        .meta
        .labels
        .iter()
        .map(|(k, v)| {
            let base = k.rsplit('/').next().unwrap_or(k);
            (format!("{KEY_PREFIX}{base}"), v.clone())
        })
        .collect();
    labels.insert(LABEL_PARENT_UID.to_string(), proxy.meta.uid.clone());
    labels.insert(LABEL_PARENT_NAME.to_string(), proxy.meta.name.clone());
    labels.insert(LABEL_PARENT_NAMESPACE.to_string(), proxy.meta.namespace.clone());
    labels.insert(
        LABEL_PARENT_CLUSTER_NAME.to_string(),
        source_cluster.to_string(),
    );

    let mut meta = ObjectMeta::new(&proxy.meta.namespace, &chaperon_name(proxy));
    meta.labels = labels;
    meta.annotations = annotations;
    if proxy.meta.has_annotation(ANNOTATION_NO_RESERVATION) {
        meta.annotations
            .insert(ANNOTATION_NO_RESERVATION.to_string(), String::new());
    }

    let mut spec = source.spec;
    remove_service_account(&mut spec);
    spec.node_name = None;
    spec.scheduler_name = Some(CANDIDATE_SCHEDULER_NAME.to_string());

    Ok(Chaperon {
        meta,
        spec,
        status: PodStatus::default(),
    })
}

/// Build the real pod for an accepted chaperon, owned by it.
///
/// A reserved chaperon yields a pod already bound to the reserved node.
pub fn make_delegate_pod(chaperon: &Chaperon) -> Pod {
    let mut meta = ObjectMeta::new(&chaperon.meta.namespace, &chaperon.meta.name);
    meta.labels = chaperon.meta.labels.clone();
    meta.annotations = chaperon.meta.annotations.clone();
    meta.owner = Some(OwnerReference {
        kind: Kind::Chaperon,
        name: chaperon.meta.name.clone(),
        uid: chaperon.meta.uid.clone(),
    });

    let mut spec = chaperon.spec.clone();
    let mut status = PodStatus {
        phase: Some(PodPhase::Pending),
        ..Default::default()
    };
    if let Some(node) = chaperon.reserved_node() {
        spec.node_name = Some(node.to_string());
        status.set_condition(scheduled_condition());
    }

    Pod { meta, spec, status }
}

/// Drop the service account token mount and its volume; the target cluster
/// projects its own.
fn remove_service_account(spec: &mut PodSpec) {
    let mut secret_volume = None;
    for c in spec
        .containers
        .iter_mut()
        .chain(spec.init_containers.iter_mut())
    {
        if let Some(i) = c
            .volume_mounts
            .iter()
            .position(|m| m.mount_path == SERVICE_ACCOUNT_MOUNT_PATH)
        {
            secret_volume = Some(c.volume_mounts.remove(i).name);
        }
    }
    if let Some(name) = secret_volume {
        spec.volumes.retain(|v| v.name != name);
    }
    spec.service_account_name = None;
}
