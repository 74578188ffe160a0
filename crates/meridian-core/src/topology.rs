//! Which clusters may place pods onto which.

use std::collections::{BTreeMap, BTreeSet};

/// Cluster pairing and federation membership, resolved from config.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// source cluster → clusters it can place onto (including itself when it targets itself).
    targets: BTreeMap<String, BTreeSet<String>>,
    federations: BTreeMap<String, BTreeSet<String>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster<I, S>(mut self, name: &str, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets
            .insert(name.to_string(), targets.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_federation<I, S>(mut self, name: &str, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.federations
            .insert(name.to_string(), members.into_iter().map(Into::into).collect());
        self
    }

    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    /// Targets of `source`, sorted.
    pub fn targets_of(&self, source: &str) -> Vec<String> {
        self.targets
            .get(source)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sources that place onto `target`, sorted.
    pub fn sources_of(&self, target: &str) -> Vec<String> {
        self.targets
            .iter()
            .filter(|(_, t)| t.contains(target))
            .map(|(s, _)| s.clone())
            .collect()
    }

    /// Clusters a pod from `source` may be scheduled to.
    ///
    /// A federation narrows the targets of `source` to the federation members;
    /// an unknown federation leaves nothing eligible.
    pub fn eligible(&self, source: &str, federation: Option<&str>) -> Vec<String> {
        let targets = self.targets_of(source);
        match federation {
            None => targets,
            Some(name) => match self.federations.get(name) {
                Some(members) => targets.into_iter().filter(|c| members.contains(c)).collect(),
                None => Vec::new(),
            },
        }
    }
}
