//! Core domain types used throughout mediapool.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Exit code reported when the requested executable could not be found.
///
/// Matches the shell convention for "command not found".
pub const EXIT_CODE_NOT_FOUND: i32 = 127;

/// Exit code reported when a process failed to spawn for any other reason.
///
/// Deliberately outside the 0-255 range real subprocesses can produce, so it
/// can never collide with a genuine exit status.
pub const EXIT_CODE_SPAWN_FAILED: i32 = 256;

static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier for a single submitted job.
///
/// Allocated from a process-wide counter so every log line can be correlated
/// to one job, even across scheduler instances.
///
/// # Example
/// ```
/// use mediapool_common::JobId;
///
/// let a = JobId::next();
/// let b = JobId::next();
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    /// Allocates the next job identifier.
    pub fn next() -> Self {
        Self(JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Number of concurrency slots a job consumes while running.
///
/// A multi-threaded transcode may occupy several slots at once; most jobs
/// take one. Values below 1 are clamped up during construction, so a
/// `Weight` is always at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Weight(u32);

impl<'de> Deserialize<'de> for Weight {
    /// Deserializes the raw slot count, clamping so the >= 1 invariant
    /// survives configuration input too.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Weight::new(u32::deserialize(deserializer)?))
    }
}

impl Weight {
    /// Creates a weight, clamping values below 1 up to 1.
    pub fn new(slots: u32) -> Self {
        Self(slots.max(1))
    }

    /// Returns the number of slots.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for Weight {
    fn default() -> Self {
        Self(1)
    }
}

impl From<u32> for Weight {
    fn from(slots: u32) -> Self {
        Self::new(slots)
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_unique() {
        let a = JobId::next();
        let b = JobId::next();
        assert!(b.get() > a.get());
    }

    #[test]
    fn test_weight_clamps_to_one() {
        assert_eq!(Weight::new(0).get(), 1);
        assert_eq!(Weight::new(1).get(), 1);
        assert_eq!(Weight::new(8).get(), 8);
        assert_eq!(Weight::default().get(), 1);
    }

    #[test]
    fn test_weight_clamps_on_deserialize() {
        let weight: Weight = serde_json::from_str("0").unwrap();
        assert_eq!(weight.get(), 1);
        let weight: Weight = serde_json::from_str("4").unwrap();
        assert_eq!(weight.get(), 4);
    }

    #[test]
    fn test_sentinels_outside_subprocess_range() {
        assert_eq!(EXIT_CODE_NOT_FOUND, 127);
        assert!(EXIT_CODE_SPAWN_FAILED > 255);
    }
}
