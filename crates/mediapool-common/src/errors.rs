//! Error types for the mediapool scheduler and job handling.
//!
//! Spawn-time failures of individual jobs are deliberately *not* modeled as
//! errors here: they are captured on the job handle as sentinel exit codes so
//! a scheduler driving many jobs never aborts on one bad command. The enums
//! below cover caller contract violations and infrastructure failures only.

use crate::types::{JobId, Weight};
use thiserror::Error;

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Result type alias for job operations.
pub type JobResult<T> = std::result::Result<T, JobError>;

/// Errors surfaced by the scheduler's public API.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// Submission was attempted after `close()`.
    #[error("scheduler is closed to new submissions")]
    Closed,

    /// The job's weight can never be admitted by the configured gate.
    #[error("job weight {weight} exceeds gate capacity {capacity}")]
    WeightExceedsCapacity { weight: Weight, capacity: u32 },
}

impl SchedulerError {
    pub fn weight_exceeds_capacity(weight: Weight, capacity: u32) -> Self {
        Self::WeightExceedsCapacity { weight, capacity }
    }
}

/// Errors surfaced by individual job handles.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// `start()` was invoked more than once on the same job.
    #[error("{id} has already been started")]
    AlreadyStarted { id: JobId },

    /// An output redirection target could not be prepared.
    #[error("{id}: failed to prepare output redirection: {reason}")]
    RedirectFailed { id: JobId, reason: String },
}

impl JobError {
    pub fn already_started(id: JobId) -> Self {
        Self::AlreadyStarted { id }
    }

    pub fn redirect_failed(id: JobId, reason: impl Into<String>) -> Self {
        Self::RedirectFailed {
            id,
            reason: reason.into(),
        }
    }
}
