//! Error types for the scheduling reconcilers.

use meridian_core::CoreError;
use meridian_placement::PlacementError;
use meridian_reconcile::ReconcileError;
use meridian_state::StateError;
use thiserror::Error;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error("{count} candidates for pod {pod} in cluster {cluster}")]
    MultipleCandidates {
        cluster: String,
        pod: String,
        count: usize,
    },
}

impl ReconcileError for SchedulerError {
    fn is_conflict(&self) -> bool {
        matches!(self, SchedulerError::State(e) if e.is_conflict())
    }
}
