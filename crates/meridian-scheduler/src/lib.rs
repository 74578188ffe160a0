//! meridian-scheduler — everything that decides where a proxy pod runs.
//!
//! - [`ScheduleReconciler`] picks a target cluster through the
//!   [`SchedulerShim`] and records it on the proxy pod
//! - [`PendingDecisions`] remembers decisions the target cluster does not
//!   show yet, so racing placements are not double counted
//! - [`ProxyPlugin`] implements the candidate reservation hooks against a
//!   target cluster's chaperons
//! - [`ProxyScheduler`] drives those hooks for every annotated proxy pod
//! - [`LocalScheduler`] is the target cluster's own scheduler: it reserves,
//!   binds or rejects chaperons on real nodes

pub mod candidate;
pub mod cycle;
pub mod error;
pub mod local;
pub mod pending;
pub mod schedule;
pub mod shim;

pub use candidate::{ProxyPlugin, Status};
pub use cycle::ProxyScheduler;
pub use error::{SchedulerError, SchedulerResult};
pub use local::{LocalKey, LocalScheduler};
pub use pending::{PendingDecision, PendingDecisions};
pub use schedule::ScheduleReconciler;
pub use shim::SchedulerShim;
