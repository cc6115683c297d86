//! Best-effort per-process CPU throttling via an external limiter tool.
//!
//! Throttling is an optional capability: when the `cpulimit` binary is not
//! installed the no-op implementation is used and jobs run unthrottled. The
//! limiter never fails a job.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Capability for capping a live process's CPU usage.
pub trait CpuLimiter: Send + Sync {
    /// Human-readable name for log output.
    fn name(&self) -> &str;

    /// Spawns a companion limiter process targeting `pid` at `percent` CPU.
    ///
    /// Returns the limiter child so the caller can terminate it alongside
    /// the throttled process, or `None` when throttling is unavailable or
    /// the limiter itself failed to spawn.
    fn throttle(&self, pid: u32, percent: u32) -> Option<Child>;
}

/// No-op limiter used when no throttling tool is available.
pub struct NoopLimiter;

impl CpuLimiter for NoopLimiter {
    fn name(&self) -> &str {
        "noop"
    }

    fn throttle(&self, _pid: u32, _percent: u32) -> Option<Child> {
        None
    }
}

/// Limiter backed by the `cpulimit` command-line tool.
pub struct CpulimitTool {
    path: PathBuf,
}

impl CpulimitTool {
    const TOOL: &'static str = "cpulimit";

    /// Looks for the tool on `PATH`.
    pub fn locate() -> Option<Self> {
        let path_var = std::env::var_os("PATH")?;
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(Self::TOOL);
            if candidate.is_file() {
                return Some(Self { path: candidate });
            }
        }
        None
    }
}

impl CpuLimiter for CpulimitTool {
    fn name(&self) -> &str {
        Self::TOOL
    }

    fn throttle(&self, pid: u32, percent: u32) -> Option<Child> {
        let mut cmd = Command::new(&self.path);
        cmd.arg("-p")
            .arg(pid.to_string())
            .arg("-l")
            .arg(percent.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match cmd.spawn() {
            Ok(child) => {
                debug!(pid, percent, "cpulimit attached");
                Some(child)
            }
            Err(e) => {
                warn!(pid, "failed to spawn cpulimit: {}", e);
                None
            }
        }
    }
}

/// Picks the best available limiter for this host.
///
/// Logs once when throttling is unavailable; absence of the tool is not an
/// error, CPU caps simply degrade to unlimited.
pub fn detect_limiter() -> Arc<dyn CpuLimiter> {
    match CpulimitTool::locate() {
        Some(tool) => {
            debug!("cpu limiter available: {}", tool.path.display());
            Arc::new(tool)
        }
        None => {
            warn!("cpulimit not found on PATH; cpu limits will not be enforced");
            Arc::new(NoopLimiter)
        }
    }
}
