//! meridiand — assembles the placement controllers of every configured
//! cluster into one process.
//!
//! [`seed`] opens and populates the cluster stores; [`daemon`] wires the
//! controllers onto their watches and runs them until shutdown.

pub mod daemon;
pub mod seed;

pub use daemon::{Settings, start};
pub use seed::{load_pod, open_clusters, seed, submit};
