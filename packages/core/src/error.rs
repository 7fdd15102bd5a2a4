//! Error taxonomy shared by every package.

use thiserror::Error;

use crate::{JobId, JobState};

/// Errors surfaced to producers, workers and operators.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No record for job {0}")]
    NoRecord(JobId),

    #[error("Invalid data: requested job {requested}, found {found}")]
    InvalidData { requested: JobId, found: JobId },

    #[error("Invalid state {state} for job {id}")]
    InvalidState { id: JobId, state: JobState },

    #[error("Job {id} failed: {message}")]
    JobFailed { id: JobId, message: String },

    #[error("Component disposed")]
    Disposed,

    #[error("Actor error: {0}")]
    Spawn(String),
}

impl QueueError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueueError::Timeout(_))
    }
}
