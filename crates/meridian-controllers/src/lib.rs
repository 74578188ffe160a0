//! meridian-controllers — reconcilers that keep clusters consistent after a
//! placement decision.
//!
//! - [`ChaperonReconciler`] (target cluster): creates the delegate pod for an
//!   accepted chaperon and mirrors the delegate back onto the chaperon
//! - [`FeedbackReconciler`] (source cluster): mirrors the active chaperon
//!   onto its proxy pod, cleans up chaperons elsewhere and holds the proxy's
//!   finalizer until every chaperon is gone
//! - [`NodePoolReconciler`]: groups nodes into node pools

pub mod chaperon;
pub mod error;
pub mod feedback;
pub mod mirror;
pub mod nodepool;

pub use chaperon::ChaperonReconciler;
pub use error::{ControllerError, ControllerResult};
pub use feedback::{DeletionPhase, FeedbackReconciler};
pub use mirror::MirrorKind;
pub use nodepool::{NodePoolReconciler, pool_of};
