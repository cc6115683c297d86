//! Job lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed job.
///
/// `Pending -> Admitting -> Starting -> Running -> Exited` is the happy path;
/// `SpawnFailed`, `Killed`, and `Discarded` are the terminal detours for
/// spawn errors, forced termination, and queued-but-never-started jobs
/// dropped during shutdown drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Constructed, not yet handed to a dispatcher.
    Pending,
    /// Waiting on weighted admission.
    Admitting,
    /// Admitted; output redirection and spawn in progress.
    Starting,
    /// OS process is running.
    Running,
    /// Process exited on its own; the exit code is recorded.
    Exited,
    /// The OS-level spawn failed; a sentinel exit code is recorded.
    SpawnFailed,
    /// Forcibly terminated (shutdown or `kill()`).
    Killed,
    /// Dropped from the queue during shutdown without ever starting.
    Discarded,
}

impl JobState {
    /// True once the job can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Exited | JobState::SpawnFailed | JobState::Killed | JobState::Discarded
        )
    }

    /// True while the job may still run or produce an exit.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Admitting => "admitting",
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Exited => "exited",
            JobState::SpawnFailed => "spawn_failed",
            JobState::Killed => "killed",
            JobState::Discarded => "discarded",
        };
        write!(f, "{}", s)
    }
}
