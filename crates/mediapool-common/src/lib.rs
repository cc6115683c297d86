//! Shared types and error definitions for the mediapool workspace.

pub mod errors;
pub mod types;

pub use errors::{JobError, JobResult, SchedulerError, SchedulerResult};
pub use types::{JobId, Weight, EXIT_CODE_NOT_FOUND, EXIT_CODE_SPAWN_FAILED};
