use crate::feed::FeedError;
use crate::store::StoreError;
use thiserror::Error;

/// Per-facility failure reported by a batch run.
///
/// None of these stop the batch; each facility carries its own outcome.
/// `InvalidFeedback` is only returned from feedback submission.
#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("persisted state corrupt: {0}")]
    StateCorrupt(String),
    #[error("persist failed: {0}")]
    PersistFailure(String),
    #[error("facility task failed: {0}")]
    TaskFailed(String),
    #[error("invalid feedback: {0}")]
    InvalidFeedback(String),
}

impl EstimatorError {
    pub fn persist(err: impl std::fmt::Display) -> Self {
        Self::PersistFailure(err.to_string())
    }
}

impl From<FeedError> for EstimatorError {
    fn from(err: FeedError) -> Self {
        Self::UpstreamUnavailable(err.to_string())
    }
}

impl From<StoreError> for EstimatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt { key, reason } => Self::StateCorrupt(format!("{key}: {reason}")),
            other => Self::UpstreamUnavailable(other.to_string()),
        }
    }
}
