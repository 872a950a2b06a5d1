use std::path::PathBuf;

use thiserror::Error;

use crate::schema::ValidationError;

/// Why a single `predict` call failed. Every variant leaves the scratch
/// directory without files from the failed call.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("a prediction is already running")]
    Busy,
    #[error("prediction failed: {0:#}")]
    Execution(#[source] anyhow::Error),
    #[error("failed to write {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl PredictError {
    /// Whether resubmitting the same request could succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, PredictError::Busy)
    }
}
