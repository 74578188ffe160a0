//! Conversions between store records and placement types.
//!
//! Bridges `meridian_core::{Node, Pod, Chaperon}` to the scorer's
//! `NodeResources` and `PlacementRequirements`.

use std::collections::BTreeSet;

use meridian_core::quantity;
use meridian_core::{Chaperon, Node, Pod, PodSpec};

use crate::scorer::{NodeResources, PlacementRequirements};

/// Convert a [`Node`] to [`NodeResources`].
///
/// `used` counts the requests of active pods bound to the node plus
/// chaperons reserved on it whose delegate pod does not exist yet.
pub fn node_to_resources(node: &Node, pods: &[Pod], chaperons: &[Chaperon]) -> NodeResources {
    let name = node.meta.name.as_str();
    let mut used = quantity::ResourceList::new();
    let mut bound = BTreeSet::new();

    for pod in pods {
        if pod.spec.node_name.as_deref() == Some(name) && pod.status.is_active() {
            quantity::add_into(&mut used, &pod.spec.resource_requests());
            bound.insert(pod.meta.table_key());
        }
    }
    for chaperon in chaperons {
        if chaperon.reserved_node() == Some(name) && !bound.contains(&chaperon.meta.table_key()) {
            quantity::add_into(&mut used, &chaperon.spec.resource_requests());
        }
    }

    NodeResources {
        node_name: name.to_string(),
        labels: node.meta.labels.clone(),
        allocatable: node.allocatable.clone(),
        used,
        unschedulable: node.unschedulable,
        is_virtual: node.is_virtual(),
    }
}

/// Convert a pod spec to [`PlacementRequirements`].
pub fn pod_to_requirements(spec: &PodSpec) -> PlacementRequirements {
    PlacementRequirements {
        requests: spec.resource_requests(),
        node_selector: spec.node_selector.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::keys::ANNOTATION_IS_RESERVED;
    use meridian_core::{Container, ObjectMeta, PodPhase, Quantity};

    fn spec(cpu: i64) -> PodSpec {
        let mut c = Container::default();
        c.resources
            .requests
            .insert("cpu".into(), Quantity::from_millis(cpu));
        PodSpec {
            containers: vec![c],
            ..Default::default()
        }
    }

    fn sample_node() -> Node {
        let mut node = Node {
            meta: ObjectMeta::new("", "n1"),
            ..Default::default()
        };
        node.allocatable.insert("cpu".into(), Quantity::from_units(2));
        node
    }

    fn pod_on(name: &str, node: &str, cpu: i64) -> Pod {
        let mut pod = Pod {
            meta: ObjectMeta::new("ns", name),
            spec: spec(cpu),
            ..Default::default()
        };
        pod.spec.node_name = Some(node.to_string());
        pod
    }

    #[test]
    fn converts_node_with_usage() {
        let mut finished = pod_on("done", "n1", 1000);
        finished.status.phase = Some(PodPhase::Succeeded);
        let pods = vec![pod_on("a", "n1", 250), pod_on("b", "n2", 500), finished];

        let res = node_to_resources(&sample_node(), &pods, &[]);
        assert_eq!(res.node_name, "n1");
        assert_eq!(res.used["cpu"].millis(), 250);
        assert_eq!(res.free("cpu").millis(), 1750);
        assert!(!res.is_virtual);
    }

    #[test]
    fn reservations_count_until_the_pod_exists() {
        let mut reserved = Chaperon {
            meta: ObjectMeta::new("ns", "c"),
            spec: spec(500),
            ..Default::default()
        };
        reserved
            .meta
            .annotations
            .insert(ANNOTATION_IS_RESERVED.into(), "n1".into());

        let res = node_to_resources(&sample_node(), &[], std::slice::from_ref(&reserved));
        assert_eq!(res.used["cpu"].millis(), 500);

        let delegate = pod_on("c", "n1", 500);
        let res = node_to_resources(&sample_node(), &[delegate], &[reserved]);
        assert_eq!(res.used["cpu"].millis(), 500);
    }

    #[test]
    fn converts_pod_requirements() {
        let mut s = spec(100);
        s.node_selector.insert("zone".into(), "a".into());
        let req = pod_to_requirements(&s);
        assert_eq!(req.requests["cpu"].millis(), 100);
        assert_eq!(req.node_selector["zone"], "a");
    }
}
