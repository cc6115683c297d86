//! ManagedJob - one external command from construction to exit.
//!
//! Construction, OS-level launch, and completion observation are decoupled:
//! `start()` returns immediately and a dedicated task performs the blocking
//! sequence (weighted admission, output redirection, spawn, exit polling,
//! teardown). Spawn failures are captured as sentinel exit codes on the
//! handle rather than raised, so a dispatcher driving many jobs never aborts
//! on one bad command.

use crate::cpu_limiter::CpuLimiter;
use crate::spec::JobSpec;
use crate::state::JobState;
use chrono::{DateTime, Utc};
use mediapool_common::{
    JobError, JobId, JobResult, Weight, EXIT_CODE_NOT_FOUND, EXIT_CODE_SPAWN_FAILED,
};
use mediapool_gate::WeightedGate;
use mediapool_shutdown::ShutdownFlags;
use std::io::ErrorKind;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Interval between non-blocking exit checks while the process runs. Chosen
/// over a blocking wait so the shutdown flags are observed promptly.
const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Slice length for admission attempts; shutdown is re-checked between
/// slices so a queued job never blocks shutdown indefinitely.
const ADMISSION_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Grace period between SIGTERM and force kill during teardown.
const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll interval while waiting out the termination grace period.
const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Handle for one managed external-process invocation.
///
/// Cheap to clone; the dispatcher and the submitting caller share the same
/// underlying job. All observation methods (`poll`, `wait`, `await_started`,
/// `state`) are safe from any task.
#[derive(Clone)]
pub struct ManagedJob {
    inner: Arc<JobInner>,
}

struct JobInner {
    id: JobId,
    spec: JobSpec,
    gate: Arc<WeightedGate>,
    shutdown: Arc<ShutdownFlags>,
    limiter: Arc<dyn CpuLimiter>,
    start_called: AtomicBool,
    kill_requested: AtomicBool,
    pid: Mutex<Option<u32>>,
    exit_code: Mutex<Option<i32>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    state_tx: watch::Sender<JobState>,
    /// Flips to true once the admission+spawn attempt has been made (or the
    /// job was discarded), whatever the outcome.
    started_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ManagedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedJob")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl ManagedJob {
    /// Creates an un-started job against the given gate and shutdown flags.
    pub fn new(
        spec: JobSpec,
        gate: Arc<WeightedGate>,
        shutdown: Arc<ShutdownFlags>,
        limiter: Arc<dyn CpuLimiter>,
    ) -> Self {
        let (state_tx, _) = watch::channel(JobState::Pending);
        let (started_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(JobInner {
                id: JobId::next(),
                spec,
                gate,
                shutdown,
                limiter,
                start_called: AtomicBool::new(false),
                kill_requested: AtomicBool::new(false),
                pid: Mutex::new(None),
                exit_code: Mutex::new(None),
                started_at: Mutex::new(None),
                state_tx,
                started_tx,
            }),
        }
    }

    pub fn id(&self) -> JobId {
        self.inner.id
    }

    pub fn weight(&self) -> Weight {
        self.inner.spec.weight
    }

    pub fn spec(&self) -> &JobSpec {
        &self.inner.spec
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        *self.inner.state_tx.borrow()
    }

    /// PID of the live OS process, if one is running.
    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock().unwrap()
    }

    /// When the OS process was spawned, if it ever was.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.started_at.lock().unwrap()
    }

    /// Non-blocking: the captured exit code, once the job has exited or
    /// failed to spawn.
    pub fn poll(&self) -> Option<i32> {
        *self.inner.exit_code.lock().unwrap()
    }

    /// Alias for [`ManagedJob::poll`].
    pub fn exit_code(&self) -> Option<i32> {
        self.poll()
    }

    /// Begins asynchronous admission and spawn. Returns immediately; the
    /// actual OS spawn happens on a dedicated task. May be called once;
    /// subsequent calls fail with `AlreadyStarted`.
    pub fn start(&self) -> JobResult<()> {
        if self.inner.start_called.swap(true, Ordering::SeqCst) {
            return Err(JobError::already_started(self.inner.id));
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run().await });
        Ok(())
    }

    /// Marks a never-started job as discarded (shutdown drain). No-op once
    /// `start()` has been called.
    pub fn discard(&self) {
        if self.inner.start_called.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(id = %self.inner.id, "discarding queued job without starting it");
        self.inner.set_state(JobState::Discarded);
        let _ = self.inner.started_tx.send(true);
    }

    /// Blocks until the admission+spawn attempt has been made (not until
    /// exit). Returns whether that point was reached within `timeout`.
    pub async fn await_started(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.inner.started_tx.subscribe();
        let observed = rx.wait_for(|started| *started);
        match timeout {
            Some(limit) => matches!(tokio::time::timeout(limit, observed).await, Ok(Ok(_))),
            None => observed.await.is_ok(),
        }
    }

    /// Blocks until the job reaches a terminal state or `timeout` elapses.
    /// Returns whether the job is no longer active.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.inner.state_tx.subscribe();
        let done = rx.wait_for(|state| state.is_terminal());
        match timeout {
            Some(limit) => {
                let _ = tokio::time::timeout(limit, done).await;
            }
            None => {
                let _ = done.await;
            }
        }
        self.state().is_terminal()
    }

    /// Requests forced termination of the underlying OS process, if any.
    ///
    /// Sets a flag observed by the poll loop and, on Unix, additionally
    /// sends SIGTERM right away so kill latency is not bound to the poll
    /// interval.
    pub fn kill(&self) {
        self.inner.kill_requested.store(true, Ordering::SeqCst);
        #[cfg(unix)]
        if let Some(pid) = self.pid() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
}

impl JobInner {
    fn set_state(&self, state: JobState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(id = %self.id, from = %previous, to = %state, "job state changed");
        }
    }

    fn record_exit_code(&self, code: Option<i32>) {
        *self.exit_code.lock().unwrap() = code;
    }

    /// The full blocking lifecycle, run on the job's dedicated task.
    async fn run(&self) {
        self.set_state(JobState::Admitting);

        // Admission: bounded acquire slices, abandoning if shutdown or an
        // early kill arrives first. Nothing to release on this path.
        loop {
            if self.shutdown.shutdown_requested() || self.kill_requested.load(Ordering::SeqCst) {
                self.set_state(JobState::Discarded);
                let _ = self.started_tx.send(true);
                return;
            }
            if self
                .gate
                .acquire(self.spec.weight, Some(ADMISSION_RETRY_INTERVAL))
                .await
            {
                break;
            }
        }

        // The gate is held from here on; every path below must release it.
        self.set_state(JobState::Starting);

        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err((code, reason)) => {
                warn!(id = %self.id, code, "spawn failed: {}", reason);
                self.record_exit_code(Some(code));
                self.set_state(JobState::SpawnFailed);
                let _ = self.started_tx.send(true);
                self.gate.release(self.spec.weight);
                return;
            }
        };

        let pid = child.id();
        *self.pid.lock().unwrap() = pid;
        *self.started_at.lock().unwrap() = Some(Utc::now());
        self.set_state(JobState::Running);
        let _ = self.started_tx.send(true);
        info!(
            id = %self.id,
            pid = pid.unwrap_or(0),
            weight = %self.spec.weight,
            "process started: {}",
            self.spec.command_line()
        );

        let limiter_child = self.attach_cpu_limiter(pid);

        self.monitor(&mut child).await;

        if let Some(mut limiter) = limiter_child {
            let _ = limiter.start_kill();
            let _ = limiter.wait().await;
        }

        *self.pid.lock().unwrap() = None;
        self.gate.release(self.spec.weight);
    }

    /// Prepares redirection targets and spawns the OS process. Failures are
    /// mapped to sentinel exit codes, never propagated.
    fn spawn_child(&self) -> Result<Child, (i32, String)> {
        let stdout = self
            .spec
            .stdout
            .open(self.id)
            .map_err(|e| (EXIT_CODE_SPAWN_FAILED, e.to_string()))?;
        let stderr = self
            .spec
            .stderr
            .open(self.id)
            .map_err(|e| (EXIT_CODE_SPAWN_FAILED, e.to_string()))?;

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args)
            .stdin(std::process::Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(ref dir) = self.spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }

        cmd.spawn().map_err(|e| {
            let code = if e.kind() == ErrorKind::NotFound {
                EXIT_CODE_NOT_FOUND
            } else {
                EXIT_CODE_SPAWN_FAILED
            };
            (code, e.to_string())
        })
    }

    fn attach_cpu_limiter(&self, pid: Option<u32>) -> Option<Child> {
        let percent = self.spec.cpu_limit.filter(|p| *p > 0)?;
        let pid = pid?;
        // A job occupying several slots gets a proportionally larger cap.
        let effective = percent.saturating_mul(self.spec.weight.get());
        self.limiter.throttle(pid, effective)
    }

    /// Poll loop: non-blocking exit checks separated by a fixed sleep, so
    /// the shutdown flags and kill requests stay visible while the process
    /// runs.
    async fn monitor(&self, child: &mut Child) {
        let interrupted = loop {
            if self.shutdown.shutdown_requested() || self.kill_requested.load(Ordering::SeqCst) {
                break true;
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.record_natural_exit(status);
                    return;
                }
                Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                Err(e) => {
                    warn!(id = %self.id, "failed to poll process status: {}", e);
                    break true;
                }
            }
        };

        if interrupted {
            let status = self.terminate(child).await;
            self.record_exit_code(status.and_then(|s| s.code()));
            self.set_state(JobState::Killed);
            info!(id = %self.id, "process terminated");
        }
    }

    fn record_natural_exit(&self, status: ExitStatus) {
        match status.code() {
            Some(code) => {
                self.record_exit_code(Some(code));
                self.set_state(JobState::Exited);
                if code == 0 {
                    info!(id = %self.id, "process exited cleanly");
                } else {
                    warn!(id = %self.id, code, "process exited with non-zero status");
                }
            }
            None => {
                // Killed by a signal we did not send.
                self.set_state(JobState::Killed);
                warn!(id = %self.id, "process terminated by signal");
            }
        }
    }

    /// Graceful-then-forced termination: SIGTERM, a bounded grace period,
    /// then a hard kill. Always reaps the child.
    async fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(id = %self.id, pid, "SIGTERM failed: {}", e);
            }
            let deadline = tokio::time::Instant::now() + FORCE_KILL_TIMEOUT;
            while tokio::time::Instant::now() < deadline {
                if let Ok(Some(status)) = child.try_wait() {
                    return Some(status);
                }
                tokio::time::sleep(TERMINATE_POLL_INTERVAL).await;
            }
            warn!(id = %self.id, pid, "graceful termination timed out, force killing");
        }

        if let Err(e) = child.kill().await {
            warn!(id = %self.id, "force kill failed: {}", e);
        }
        child.wait().await.ok()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cpu_limiter::NoopLimiter;
    use crate::spec::OutputTarget;

    fn test_fixture() -> (Arc<WeightedGate>, Arc<ShutdownFlags>, Arc<dyn CpuLimiter>) {
        (
            Arc::new(WeightedGate::new(4)),
            ShutdownFlags::new(),
            Arc::new(NoopLimiter),
        )
    }

    fn sh(script: &str) -> JobSpec {
        JobSpec::new("sh", ["-c", script])
    }

    #[tokio::test]
    async fn test_successful_exit_zero() {
        let (gate, shutdown, limiter) = test_fixture();
        let job = ManagedJob::new(sh("exit 0"), Arc::clone(&gate), shutdown, limiter);
        job.start().unwrap();
        assert!(job.wait(Some(Duration::from_secs(10))).await);
        assert_eq!(job.poll(), Some(0));
        assert_eq!(job.state(), JobState::Exited);
        assert!(job.started_at().is_some());
        assert_eq!(gate.requested(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_passed_through() {
        let (gate, shutdown, limiter) = test_fixture();
        let job = ManagedJob::new(sh("exit 3"), gate, shutdown, limiter);
        job.start().unwrap();
        assert!(job.wait(Some(Duration::from_secs(10))).await);
        assert_eq!(job.poll(), Some(3));
        assert_eq!(job.state(), JobState::Exited);
    }

    #[tokio::test]
    async fn test_missing_executable_reports_not_found_sentinel() {
        let (gate, shutdown, limiter) = test_fixture();
        let spec = JobSpec::new("mediapool-no-such-binary", Vec::<String>::new());
        let job = ManagedJob::new(spec, Arc::clone(&gate), shutdown, limiter);
        job.start().unwrap();
        assert!(job.wait(Some(Duration::from_secs(10))).await);
        assert_eq!(job.poll(), Some(EXIT_CODE_NOT_FOUND));
        assert_eq!(job.state(), JobState::SpawnFailed);
        // Slots must not leak on the failure path.
        assert_eq!(gate.requested(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (gate, shutdown, limiter) = test_fixture();
        let job = ManagedJob::new(sh("exit 0"), gate, shutdown, limiter);
        job.start().unwrap();
        assert!(matches!(job.start(), Err(JobError::AlreadyStarted { .. })));
        job.wait(Some(Duration::from_secs(10))).await;
    }

    #[tokio::test]
    async fn test_kill_terminates_long_running_job() {
        let (gate, shutdown, limiter) = test_fixture();
        let job = ManagedJob::new(sh("sleep 60"), Arc::clone(&gate), shutdown, limiter);
        job.start().unwrap();
        assert!(job.await_started(Some(Duration::from_secs(10))).await);
        job.kill();
        assert!(job.wait(Some(Duration::from_secs(10))).await);
        assert_eq!(job.state(), JobState::Killed);
        assert_eq!(gate.requested(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_flag_terminates_running_job() {
        let (gate, shutdown, limiter) = test_fixture();
        let job = ManagedJob::new(sh("sleep 60"), gate, Arc::clone(&shutdown), limiter);
        job.start().unwrap();
        assert!(job.await_started(Some(Duration::from_secs(10))).await);
        shutdown.request_terminate();
        assert!(job.wait(Some(Duration::from_secs(10))).await);
        assert_eq!(job.state(), JobState::Killed);
    }

    #[tokio::test]
    async fn test_shutdown_before_admission_discards_job() {
        let (gate, shutdown, limiter) = test_fixture();
        shutdown.request_interrupt();
        let job = ManagedJob::new(sh("exit 0"), Arc::clone(&gate), shutdown, limiter);
        job.start().unwrap();
        assert!(job.wait(Some(Duration::from_secs(5))).await);
        assert_eq!(job.state(), JobState::Discarded);
        assert_eq!(job.poll(), None);
        assert!(job.started_at().is_none());
        assert_eq!(gate.requested(), 0);
    }

    #[tokio::test]
    async fn test_stdout_redirection_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("logs/job/out.log");
        let (gate, shutdown, limiter) = test_fixture();
        let spec = sh("echo redirected").with_stdout(OutputTarget::File(out.clone()));
        let job = ManagedJob::new(spec, gate, shutdown, limiter);
        job.start().unwrap();
        assert!(job.wait(Some(Duration::from_secs(10))).await);
        assert_eq!(job.poll(), Some(0));
        let contents = std::fs::read_to_string(&out).unwrap();
        assert!(contents.contains("redirected"));
    }

    #[tokio::test]
    async fn test_await_started_reflects_admission_and_spawn() {
        let (_, shutdown, limiter) = test_fixture();
        // Capacity 1 and a blocker job: the second job cannot start until
        // the first releases its slot.
        let gate = Arc::new(WeightedGate::new(1));
        let blocker = ManagedJob::new(
            sh("sleep 2"),
            Arc::clone(&gate),
            Arc::clone(&shutdown),
            Arc::clone(&limiter),
        );
        blocker.start().unwrap();
        assert!(blocker.await_started(Some(Duration::from_secs(10))).await);

        let queued = ManagedJob::new(sh("exit 0"), Arc::clone(&gate), shutdown, limiter);
        queued.start().unwrap();
        assert!(!queued.await_started(Some(Duration::from_millis(200))).await);

        assert!(blocker.wait(Some(Duration::from_secs(15))).await);
        assert!(queued.await_started(Some(Duration::from_secs(10))).await);
        assert!(queued.wait(Some(Duration::from_secs(10))).await);
        assert_eq!(queued.poll(), Some(0));
    }

    #[tokio::test]
    async fn test_discard_is_noop_after_start() {
        let (gate, shutdown, limiter) = test_fixture();
        let job = ManagedJob::new(sh("exit 0"), gate, shutdown, limiter);
        job.start().unwrap();
        job.discard();
        assert!(job.wait(Some(Duration::from_secs(10))).await);
        assert_eq!(job.state(), JobState::Exited);
    }
}
