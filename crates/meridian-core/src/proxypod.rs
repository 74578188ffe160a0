//! Proxy pod model: the source-cluster stand-in for a workload being placed.

use crate::error::{CoreError, CoreResult};
use crate::keys::*;
use crate::naming;
use crate::types::{Pod, Toleration};

/// Pods carrying the `elect` annotation take part in multi-cluster placement.
pub fn is_proxy(pod: &Pod) -> bool {
    pod.meta.has_annotation(ANNOTATION_ELECT)
}

/// Bound to a virtual node, i.e. the candidate protocol has finished.
pub fn is_scheduled(pod: &Pod) -> bool {
    pod.spec.node_name.is_some()
}

/// Target cluster recorded by the Schedule Reconciler (or by the final bind).
pub fn target_cluster(pod: &Pod) -> Option<&str> {
    pod.meta.annotation(ANNOTATION_CLUSTER_NAME)
}

pub fn federation(pod: &Pod) -> Option<&str> {
    pod.meta.annotation(ANNOTATION_FEDERATION_NAME)
}

/// Decode the source pod snapshot embedded at admission.
pub fn source_pod(proxy: &Pod) -> CoreResult<Pod> {
    let manifest =
        proxy
            .meta
            .annotation(ANNOTATION_SOURCE_POD_MANIFEST)
            .ok_or_else(|| CoreError::MissingAnnotation {
                pod: proxy.meta.table_key(),
                key: ANNOTATION_SOURCE_POD_MANIFEST,
            })?;
    serde_json::from_str(manifest).map_err(|source| CoreError::Manifest {
        pod: proxy.meta.table_key(),
        source,
    })
}

/// Name of the node standing for `cluster` in every cluster that targets it.
pub fn virtual_node_name(cluster: &str) -> String {
    naming::from_parts(naming::LONG, &[0], &[], &[VIRTUAL_KUBELET_PROVIDER_NAME, cluster])
}

/// Turn a submitted pod into a proxy pod. Pods without `elect` are returned unchanged.
///
/// The original manifest is captured only once, so re-admitting a proxy pod
/// keeps its first snapshot.
pub fn mutate(pod: &Pod) -> CoreResult<Pod> {
    let mut proxy = pod.clone();
    if !is_proxy(pod) {
        return Ok(proxy);
    }

    if !proxy.meta.has_annotation(ANNOTATION_SOURCE_POD_MANIFEST) {
        let manifest = serde_json::to_string(pod)?;
        proxy
            .meta
            .annotations
            .insert(ANNOTATION_SOURCE_POD_MANIFEST.to_string(), manifest);
    }

    proxy.spec.node_selector.clear();
    proxy.spec.node_selector.insert(
        LABEL_VIRTUAL_KUBELET_PROVIDER.to_string(),
        VIRTUAL_KUBELET_PROVIDER_NAME.to_string(),
    );
    proxy.spec.tolerations = vec![Toleration {
        key: LABEL_VIRTUAL_KUBELET_PROVIDER.to_string(),
        operator: Some("Equal".to_string()),
        value: Some(VIRTUAL_KUBELET_PROVIDER_NAME.to_string()),
        effect: None,
    }];
    proxy.spec.affinity = None;
    proxy.spec.topology_spread_constraints.clear();
    proxy.spec.scheduler_name = Some(PROXY_SCHEDULER_NAME.to_string());
    proxy.spec.termination_grace_period_seconds = Some(0);

    proxy.meta.finalizers.retain(|f| !is_placement_key(f));
    proxy
        .meta
        .labels
        .insert(LABEL_HAS_FINALIZER.to_string(), "true".to_string());

    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectMeta;

    fn elect_pod() -> Pod {
        let mut pod = Pod {
            meta: ObjectMeta::new("ns1", "pod1"),
            ..Default::default()
        };
        pod.meta
            .annotations
            .insert(ANNOTATION_ELECT.to_string(), String::new());
        pod.spec
            .node_selector
            .insert("zone".to_string(), "a".to_string());
        pod.spec.scheduler_name = Some("custom".to_string());
        pod.spec.affinity = Some(serde_json::json!({"nodeAffinity": {}}));
        pod
    }

    #[test]
    fn mutate_ignores_pods_without_elect() {
        let mut pod = elect_pod();
        pod.meta.annotations.clear();
        assert_eq!(mutate(&pod).unwrap(), pod);
    }

    #[test]
    fn mutate_snapshots_and_strips_constraints() {
        let pod = elect_pod();
        let proxy = mutate(&pod).unwrap();

        assert!(is_proxy(&proxy));
        assert_eq!(proxy.spec.scheduler_name.as_deref(), Some(PROXY_SCHEDULER_NAME));
        assert_eq!(proxy.spec.node_selector.len(), 1);
        assert!(proxy.spec.affinity.is_none());
        assert_eq!(proxy.meta.label(LABEL_HAS_FINALIZER), Some("true"));

        let source = source_pod(&proxy).unwrap();
        assert_eq!(source.spec.node_selector["zone"], "a");
        assert_eq!(source.spec.scheduler_name.as_deref(), Some("custom"));
    }

    #[test]
    fn mutate_keeps_first_snapshot() {
        let proxy = mutate(&elect_pod()).unwrap();
        let again = mutate(&proxy).unwrap();
        assert_eq!(
            proxy.meta.annotation(ANNOTATION_SOURCE_POD_MANIFEST),
            again.meta.annotation(ANNOTATION_SOURCE_POD_MANIFEST)
        );
    }

    #[test]
    fn source_pod_errors() {
        let mut pod = elect_pod();
        assert!(matches!(
            source_pod(&pod),
            Err(CoreError::MissingAnnotation { .. })
        ));
        pod.meta
            .annotations
            .insert(ANNOTATION_SOURCE_POD_MANIFEST.to_string(), "{not json".to_string());
        assert!(matches!(source_pod(&pod), Err(CoreError::Manifest { .. })));
    }

    #[test]
    fn virtual_node_names() {
        assert_eq!(virtual_node_name("c2"), "meridian-c2");
    }
}
