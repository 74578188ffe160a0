//! meridian-core — shared model for multi-cluster pod placement.
//!
//! Holds the record types every cluster store persists (pods, chaperons,
//! nodes, node pools), the annotation/label keys that form the wire protocol
//! between clusters, and the pure transforms between the pod flavours:
//!
//! ```text
//! source pod ──mutate──▶ proxy pod ──make_chaperon──▶ chaperon ──▶ delegate pod
//! ```

pub mod config;
pub mod delegatepod;
pub mod error;
pub mod keys;
pub mod naming;
pub mod proxypod;
pub mod quantity;
pub mod topology;
pub mod types;

pub use config::MeridianConfig;
pub use error::{CoreError, CoreResult};
pub use quantity::{Quantity, ResourceList};
pub use topology::Topology;
pub use types::*;
