//! redb table definitions for a cluster store.
//!
//! Record tables use `&str` keys (`{namespace}/{name}`, or `{name}` for
//! cluster-scoped kinds) and `&[u8]` values (JSON-serialized records).

use meridian_core::Kind;
use redb::TableDefinition;

/// Pods (proxy, delegate and plain) keyed by `{namespace}/{name}`.
pub const PODS: TableDefinition<&str, &[u8]> = TableDefinition::new("pods");

/// Chaperons keyed by `{namespace}/{name}`.
pub const CHAPERONS: TableDefinition<&str, &[u8]> = TableDefinition::new("chaperons");

/// Nodes keyed by `{name}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Node pools keyed by `{name}`.
pub const NODE_POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("node_pools");

/// Store-wide counters (`resource_version`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const RESOURCE_VERSION_KEY: &str = "resource_version";

pub fn table_for(kind: Kind) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match kind {
        Kind::Pod => PODS,
        Kind::Chaperon => CHAPERONS,
        Kind::Node => NODES,
        Kind::NodePool => NODE_POOLS,
    }
}
