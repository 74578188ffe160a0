//! Error types for the core model.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("pod {pod} has no {key} annotation")]
    MissingAnnotation { pod: String, key: &'static str },

    #[error("cannot decode source pod manifest of {pod}: {source}")]
    Manifest {
        pod: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode source pod manifest: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid quantity {0:?}")]
    Quantity(String),

    #[error("invalid config: {0}")]
    Config(String),
}
