use thiserror::Error;

use crate::job::JobStatus;

/// Errors surfaced by the ingestion pipeline.
///
/// Malformed lines and scoring trouble are degradations, not errors, and
/// never show up here except for `Scoring`, which stays internal to the scorer.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("upload has {lines} lines, limit is {limit}")]
    SizeLimitExceeded { lines: usize, limit: usize },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("dispatch failure: {0}")]
    Dispatch(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {job_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("scoring failed: {0}")]
    Scoring(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Wrap a store/driver error, keeping its message verbatim
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        PipelineError::Persistence(err.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
