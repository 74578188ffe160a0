//! Error types for the cross-cluster controllers.

use meridian_core::{CoreError, Kind};
use meridian_reconcile::ReconcileError;
use meridian_state::StateError;
use thiserror::Error;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// A record exists under the expected name but another owner controls it.
    #[error("{kind} {key} in cluster {cluster} is not controlled by {owner}")]
    OwnershipConflict {
        cluster: String,
        kind: Kind,
        key: String,
        owner: String,
    },

    #[error("{count} chaperons for pod {pod} in cluster {cluster}")]
    MultipleCandidates {
        cluster: String,
        pod: String,
        count: usize,
    },
}

impl ControllerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ControllerError::State(e) if e.is_not_found())
    }
}

impl ReconcileError for ControllerError {
    fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::State(e) if e.is_conflict())
    }
}
