//! Per-kind mirror strategies.
//!
//! Both mirrors copy from a child record up to its parent: the delegate pod
//! onto its chaperon, and the chaperon onto its proxy pod. Placement keys
//! never travel; each side keeps its own.

use std::collections::BTreeMap;

use meridian_core::PodStatus;
use meridian_core::keys::is_placement_key;

/// Which parent/child pair is being mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorKind {
    /// Delegate pod → chaperon, in the target cluster.
    Delegate,
    /// Chaperon → proxy pod, across clusters.
    Feedback,
}

fn user_annotations(all: &BTreeMap<String, String>) -> BTreeMap<&str, &str> {
    all.iter()
        .filter(|(k, _)| !is_placement_key(k))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

impl MirrorKind {
    /// Whether the user annotations of `from` differ from those of `to`.
    pub fn annotations_need_update(
        self,
        from: &BTreeMap<String, String>,
        to: &BTreeMap<String, String>,
    ) -> bool {
        user_annotations(from) != user_annotations(to)
    }

    /// Replace the user annotations of `to` with those of `from`.
    pub fn mutate_annotations(
        self,
        from: &BTreeMap<String, String>,
        to: &mut BTreeMap<String, String>,
    ) {
        to.retain(|k, _| is_placement_key(k));
        for (k, v) in from {
            if !is_placement_key(k) {
                to.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn status_needs_update(self, from: &PodStatus, to: &PodStatus) -> bool {
        match self {
            MirrorKind::Delegate => from != to,
            // A chaperon nobody has reported on yet carries no phase; its
            // empty status must not wipe the proxy's own conditions.
            MirrorKind::Feedback => from.phase.is_some() && from != to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::PodPhase;
    use meridian_core::keys::{ANNOTATION_CLUSTER_NAME, ANNOTATION_IS_ALLOWED};

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn placement_keys_are_ignored() {
        let from = annotations(&[("team", "infra"), (ANNOTATION_IS_ALLOWED, "")]);
        let to = annotations(&[("team", "infra"), (ANNOTATION_CLUSTER_NAME, "c2")]);
        assert!(!MirrorKind::Feedback.annotations_need_update(&from, &to));
    }

    #[test]
    fn mutate_keeps_own_placement_keys() {
        let from = annotations(&[("team", "infra"), ("owner", "ops"), (ANNOTATION_IS_ALLOWED, "")]);
        let mut to = annotations(&[("team", "web"), ("stale", "x"), (ANNOTATION_CLUSTER_NAME, "c2")]);
        assert!(MirrorKind::Feedback.annotations_need_update(&from, &to));

        MirrorKind::Feedback.mutate_annotations(&from, &mut to);
        assert_eq!(
            to,
            annotations(&[("team", "infra"), ("owner", "ops"), (ANNOTATION_CLUSTER_NAME, "c2")])
        );
        assert!(!MirrorKind::Feedback.annotations_need_update(&from, &to));
    }

    #[test]
    fn feedback_skips_unreported_status() {
        let empty = PodStatus::default();
        let proxy = PodStatus {
            phase: Some(PodPhase::Pending),
            ..Default::default()
        };
        assert!(!MirrorKind::Feedback.status_needs_update(&empty, &proxy));
        assert!(MirrorKind::Delegate.status_needs_update(&empty, &proxy));

        let running = PodStatus {
            phase: Some(PodPhase::Running),
            ..Default::default()
        };
        assert!(MirrorKind::Feedback.status_needs_update(&running, &proxy));
        assert!(!MirrorKind::Feedback.status_needs_update(&running, &running));
    }
}
