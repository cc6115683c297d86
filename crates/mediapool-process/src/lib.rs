//! Managed external-process jobs.
//!
//! A [`ManagedJob`] wraps one external command invocation, decoupling
//! construction from OS-level launch from completion observation. Launch is
//! asynchronous: `start()` returns immediately and a dedicated task performs
//! weighted admission, output redirection, spawn, and the exit poll loop.

pub mod cpu_limiter;
pub mod job;
pub mod spec;
pub mod state;

pub use cpu_limiter::{detect_limiter, CpuLimiter, CpulimitTool, NoopLimiter};
pub use job::ManagedJob;
pub use spec::{JobSpec, OutputTarget};
pub use state::JobState;
