//! meridian.toml configuration parser.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::quantity::ResourceList;
use crate::topology::Topology;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeridianConfig {
    /// Directory for on-disk cluster stores; in-memory when absent.
    pub data_dir: Option<PathBuf>,
    pub engine: Option<EngineConfig>,
    pub candidate: Option<CandidateConfig>,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub federations: Vec<FederationConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub workers: Option<usize>,
    pub base_backoff_ms: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub conflict_requeue_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateConfig {
    pub poll_interval_ms: Option<u64>,
    pub filter_wait_secs: Option<u64>,
    pub pre_bind_wait_secs: Option<u64>,
    pub permit_wait_secs: Option<u64>,
    pub retry_unschedulable_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub targets: Vec<String>,
    pub target_self: Option<bool>,
    #[serde(default)]
    pub forbidden_namespaces: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub node_pools: Vec<NodePoolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub pool: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub allocatable: ResourceList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePoolConfig {
    pub name: String,
    pub min_nodes: Option<u32>,
    pub max_nodes: Option<u32>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub allocatable: ResourceList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    pub name: String,
    #[serde(default)]
    pub clusters: Vec<String>,
}

/// Engine settings with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub workers: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub conflict_requeue: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineConfig::default().settings()
    }
}

/// Candidate protocol timings with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSettings {
    pub poll_interval: Duration,
    pub filter_wait: Duration,
    pub pre_bind_wait: Duration,
    pub permit_wait: Duration,
    pub retry_unschedulable: Duration,
}

impl Default for CandidateSettings {
    fn default() -> Self {
        CandidateConfig::default().settings()
    }
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            workers: self.workers.unwrap_or(1),
            base_backoff: Duration::from_millis(self.base_backoff_ms.unwrap_or(5)),
            max_backoff: Duration::from_secs(self.max_backoff_secs.unwrap_or(1000)),
            conflict_requeue: Duration::from_millis(self.conflict_requeue_ms.unwrap_or(1000)),
        }
    }
}

impl CandidateConfig {
    pub fn settings(&self) -> CandidateSettings {
        CandidateSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms.unwrap_or(1000)),
            filter_wait: Duration::from_secs(self.filter_wait_secs.unwrap_or(30)),
            pre_bind_wait: Duration::from_secs(self.pre_bind_wait_secs.unwrap_or(60)),
            permit_wait: Duration::from_secs(self.permit_wait_secs.unwrap_or(30)),
            retry_unschedulable: Duration::from_secs(self.retry_unschedulable_secs.unwrap_or(10)),
        }
    }
}

impl ClusterConfig {
    pub fn target_self(&self) -> bool {
        self.target_self.unwrap_or(true)
    }

    /// Configured targets plus the cluster itself when it targets itself.
    pub fn all_targets(&self) -> BTreeSet<String> {
        let mut all: BTreeSet<String> = self.targets.iter().cloned().collect();
        if self.target_self() {
            all.insert(self.name.clone());
        }
        all
    }
}

impl MeridianConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MeridianConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn engine(&self) -> EngineSettings {
        self.engine.clone().unwrap_or_default().settings()
    }

    pub fn candidate(&self) -> CandidateSettings {
        self.candidate.clone().unwrap_or_default().settings()
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }

    pub fn topology(&self) -> Topology {
        let mut topology = Topology::new();
        for cluster in &self.clusters {
            topology = topology.with_cluster(&cluster.name, cluster.all_targets());
        }
        for federation in &self.federations {
            topology = topology.with_federation(&federation.name, federation.clusters.iter().cloned());
        }
        topology
    }

    pub fn validate(&self) -> CoreResult<()> {
        let invalid = |msg: String| Err(CoreError::Config(msg));

        let mut names = BTreeSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return invalid("cluster with empty name".to_string());
            }
            if !names.insert(cluster.name.as_str()) {
                return invalid(format!("duplicate cluster {}", cluster.name));
            }
        }
        for cluster in &self.clusters {
            if let Some(unknown) = cluster.targets.iter().find(|t| !names.contains(t.as_str())) {
                return invalid(format!("cluster {} targets unknown cluster {unknown}", cluster.name));
            }
        }
        for federation in &self.federations {
            if let Some(unknown) = federation
                .clusters
                .iter()
                .find(|c| !names.contains(c.as_str()))
            {
                return invalid(format!(
                    "federation {} lists unknown cluster {unknown}",
                    federation.name
                ));
            }
        }

        if self.engine().workers == 0 {
            return invalid("engine.workers must be at least 1".to_string());
        }
        if self.candidate().poll_interval.is_zero() {
            return invalid("candidate.poll_interval_ms must be positive".to_string());
        }
        Ok(())
    }
}
