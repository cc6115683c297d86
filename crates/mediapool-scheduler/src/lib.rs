//! Bounded job queue plus the dispatch loop that turns queued jobs into
//! running processes, respecting a shared [`WeightedGate`].
//!
//! Submissions block when the queue is at its depth bound (backpressure) and
//! return a [`ManagedJob`] handle immediately; the dispatch loop dequeues in
//! strict FIFO order and retries a descriptor in place until it is admitted,
//! so a heavy job is never starved by lighter ones arriving behind it.

use mediapool_common::{JobId, SchedulerError, SchedulerResult};
use mediapool_gate::WeightedGate;
use mediapool_process::{detect_limiter, CpuLimiter, JobSpec, ManagedJob};
use mediapool_shutdown::ShutdownFlags;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Default queue depth: submissions beyond this block the submitter.
const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Bounded wait per dequeue attempt, so the dispatch loop stays responsive
/// to shutdown.
const DEQUEUE_WAIT: Duration = Duration::from_millis(250);

/// Slice length while awaiting a dispatched job's started signal.
const STARTED_WAIT: Duration = Duration::from_millis(500);

/// Recheck slice for drain waiters, guarding against missed notifications.
const DRAIN_RECHECK: Duration = Duration::from_millis(100);

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Total concurrency slots the shared gate admits.
    pub capacity: u32,
    /// Queue depth bound; `submit` blocks when the queue is full.
    pub queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: WeightedGate::default_capacity(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Shared bookkeeping between the scheduler handle, the dispatch loop, and
/// the per-job completion watchers.
struct SchedulerShared {
    gate: Arc<WeightedGate>,
    /// Jobs submitted but not yet terminal (queued, admitting, or running).
    unfinished: AtomicUsize,
    drained: Notify,
}

impl SchedulerShared {
    fn job_finished(&self, id: JobId) {
        let left = self.unfinished.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(id = %id, unfinished = left, "job reached terminal state");
        self.drained.notify_waiters();
    }

    fn is_drained(&self) -> bool {
        self.unfinished.load(Ordering::SeqCst) == 0 && self.gate.requested() == 0
    }
}

/// Owns the bounded queue and the persistent dispatch loop; lives for the
/// lifetime of the application.
pub struct JobScheduler {
    shared: Arc<SchedulerShared>,
    shutdown: Arc<ShutdownFlags>,
    limiter: Arc<dyn CpuLimiter>,
    /// Taken (dropped) by `close()`; a closed scheduler rejects submissions.
    queue_tx: Mutex<Option<mpsc::Sender<ManagedJob>>>,
}

impl JobScheduler {
    /// Creates the scheduler and starts its dispatch loop.
    pub fn new(config: SchedulerConfig, shutdown: Arc<ShutdownFlags>) -> Arc<Self> {
        let gate = Arc::new(WeightedGate::new(config.capacity));
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_depth.max(1));
        let shared = Arc::new(SchedulerShared {
            gate,
            unfinished: AtomicUsize::new(0),
            drained: Notify::new(),
        });

        info!(
            capacity = config.capacity,
            queue_depth = config.queue_depth,
            "job scheduler started"
        );

        tokio::spawn(dispatch_loop(
            queue_rx,
            Arc::clone(&shared),
            Arc::clone(&shutdown),
        ));

        Arc::new(Self {
            shared,
            shutdown,
            limiter: detect_limiter(),
            queue_tx: Mutex::new(Some(queue_tx)),
        })
    }

    /// The shared admission gate, for collaborators that run work outside
    /// the queue but inside the same concurrency budget.
    pub fn gate(&self) -> Arc<WeightedGate> {
        Arc::clone(&self.shared.gate)
    }

    /// Constructs a job from `spec`, enqueues it (blocking while the queue
    /// is full), and returns its handle immediately.
    ///
    /// Fails fast after `close()`, and rejects weights the gate could never
    /// admit rather than letting them retry forever.
    pub async fn submit(&self, spec: JobSpec) -> SchedulerResult<ManagedJob> {
        let weight = spec.weight;
        let capacity = self.shared.gate.capacity();
        if weight.get() > capacity {
            return Err(SchedulerError::weight_exceeds_capacity(weight, capacity));
        }

        let tx = self
            .queue_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(SchedulerError::Closed)?;

        let job = ManagedJob::new(
            spec,
            self.gate(),
            Arc::clone(&self.shutdown),
            Arc::clone(&self.limiter),
        );
        self.shared.unfinished.fetch_add(1, Ordering::SeqCst);

        if tx.send(job.clone()).await.is_err() {
            // The dispatch loop already exited (shutdown); the job will
            // never be dequeued.
            job.discard();
            self.shared.job_finished(job.id());
            return Err(SchedulerError::Closed);
        }

        debug!(id = %job.id(), weight = %job.weight(), "job queued");
        Ok(job)
    }

    /// Stops accepting submissions. Queued and in-flight jobs are not
    /// affected. Idempotent.
    pub fn close(&self) {
        if self.queue_tx.lock().unwrap().take().is_some() {
            info!("scheduler closed to new submissions");
        }
    }

    /// Returns true once every submitted job is terminal and the gate holds
    /// no slots, or false when `timeout` elapses first. `None` waits
    /// indefinitely.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
        loop {
            if self.shared.is_drained() {
                return true;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return self.shared.is_drained();
                    }
                    DRAIN_RECHECK.min(deadline - now)
                }
                None => DRAIN_RECHECK,
            };
            let _ = tokio::time::timeout(slice, self.shared.drained.notified()).await;
        }
    }
}

/// The persistent dispatch loop: dequeues in FIFO order, starts each job,
/// and holds position until that job's admission+spawn attempt has been
/// made (in-place retry). Exits when the queue is closed and empty or when
/// shutdown is requested, then drains leftover descriptors without starting
/// them.
async fn dispatch_loop(
    mut queue_rx: mpsc::Receiver<ManagedJob>,
    shared: Arc<SchedulerShared>,
    shutdown: Arc<ShutdownFlags>,
) {
    loop {
        if shutdown.shutdown_requested() {
            break;
        }
        let job = match tokio::time::timeout(DEQUEUE_WAIT, queue_rx.recv()).await {
            // Bounded idle tick; go back and re-check shutdown.
            Err(_) => continue,
            // Queue closed and fully drained.
            Ok(None) => {
                debug!("queue closed and empty; dispatch loop exiting");
                break;
            }
            Ok(Some(job)) => job,
        };

        debug!(id = %job.id(), weight = %job.weight(), "dispatching job");
        if let Err(e) = job.start() {
            // Start only fails on a double-start, which the queue never
            // produces; account for the job either way.
            warn!(id = %job.id(), "failed to start dequeued job: {}", e);
            shared.job_finished(job.id());
            continue;
        }

        spawn_completion_watcher(job.clone(), Arc::clone(&shared));

        // In-place retry: the next descriptor is not attempted until this
        // one's admission+spawn attempt has been made or shutdown wins.
        while !job.await_started(Some(STARTED_WAIT)).await {
            if shutdown.shutdown_requested() {
                break;
            }
        }
    }

    // Close before draining: a send racing the shutdown observation either
    // lands in the buffer (drained below) or fails at the submitter, never
    // both and never neither. Anything buffered is discarded without
    // starting.
    queue_rx.close();
    while let Some(job) = queue_rx.recv().await {
        job.discard();
        shared.job_finished(job.id());
    }
    info!("dispatch loop terminated");
}

/// One watcher task per dispatched job: reports terminal state back to the
/// drain accounting.
fn spawn_completion_watcher(job: ManagedJob, shared: Arc<SchedulerShared>) {
    tokio::spawn(async move {
        job.wait(None).await;
        shared.job_finished(job.id());
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use mediapool_process::JobState;

    fn sh(script: &str) -> JobSpec {
        JobSpec::new("sh", ["-c", script])
    }

    fn scheduler(capacity: u32) -> (Arc<JobScheduler>, Arc<ShutdownFlags>) {
        let shutdown = ShutdownFlags::new();
        let config = SchedulerConfig {
            capacity,
            queue_depth: 16,
        };
        (JobScheduler::new(config, Arc::clone(&shutdown)), shutdown)
    }

    #[tokio::test]
    async fn test_submit_after_close_fails_fast() {
        let (scheduler, _shutdown) = scheduler(2);
        scheduler.close();
        assert!(matches!(
            scheduler.submit(sh("exit 0")).await,
            Err(SchedulerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (scheduler, _shutdown) = scheduler(2);
        scheduler.close();
        scheduler.close();
    }

    #[tokio::test]
    async fn test_weight_over_capacity_rejected_at_submit() {
        let (scheduler, _shutdown) = scheduler(2);
        let err = scheduler
            .submit(sh("exit 0").with_weight(3))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::WeightExceedsCapacity { .. }));
        // The rejected job must not count against drain.
        assert!(scheduler.wait(Some(Duration::from_millis(100))).await);
    }

    #[tokio::test]
    async fn test_wait_on_idle_scheduler_returns_immediately() {
        let (scheduler, _shutdown) = scheduler(2);
        assert!(scheduler.wait(Some(Duration::from_millis(50))).await);
    }

    #[tokio::test]
    async fn test_wait_times_out_while_job_runs() {
        let (scheduler, _shutdown) = scheduler(2);
        let job = scheduler.submit(sh("sleep 5")).await.unwrap();
        assert!(job.await_started(Some(Duration::from_secs(10))).await);
        assert!(!scheduler.wait(Some(Duration::from_millis(100))).await);
        job.kill();
        assert!(scheduler.wait(Some(Duration::from_secs(10))).await);
    }

    #[tokio::test]
    async fn test_submitted_job_runs_and_drains() {
        let (scheduler, _shutdown) = scheduler(2);
        let job = scheduler.submit(sh("exit 0")).await.unwrap();
        assert!(job.wait(Some(Duration::from_secs(10))).await);
        assert_eq!(job.poll(), Some(0));
        assert_eq!(job.state(), JobState::Exited);
        assert!(scheduler.wait(Some(Duration::from_secs(5))).await);
    }

    #[tokio::test]
    async fn test_shutdown_racing_submissions_never_strand_a_job() {
        // Shutdown is requested before the submissions land. Whether the
        // dispatch loop has observed the flag yet or not, every submission
        // must either fail fast or return a handle that still reaches a
        // terminal state; a job may never be silently lost with the drain
        // accounting left hanging.
        let (scheduler, shutdown) = scheduler(2);
        shutdown.request_interrupt();

        let mut handles = Vec::new();
        for _ in 0..8 {
            match scheduler.submit(sh("exit 0")).await {
                Ok(job) => handles.push(job),
                Err(SchedulerError::Closed) => {}
                Err(e) => panic!("unexpected submit error: {}", e),
            }
        }

        assert!(scheduler.wait(Some(Duration::from_secs(10))).await);
        for job in handles {
            assert!(
                job.state().is_terminal(),
                "{} stranded in {}",
                job.id(),
                job.state()
            );
        }
    }

    #[tokio::test]
    async fn test_full_queue_blocks_submitter_without_dropping() {
        let shutdown = ShutdownFlags::new();
        let config = SchedulerConfig {
            capacity: 1,
            queue_depth: 1,
        };
        let scheduler = JobScheduler::new(config, Arc::clone(&shutdown));

        // Occupies the whole gate for about a second.
        let running = scheduler.submit(sh("sleep 1")).await.unwrap();
        assert!(running.await_started(Some(Duration::from_secs(10))).await);

        // Dequeued immediately and held in the in-place admission retry.
        let admitting = scheduler.submit(sh("exit 0")).await.unwrap();
        // Fills the one-slot buffer.
        let buffered = scheduler.submit(sh("exit 0")).await.unwrap();

        // Queue full, dispatcher busy: this submission must block the
        // submitter rather than drop or error.
        let blocked = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.submit(sh("exit 0")).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!blocked.is_finished(), "submit resolved despite a full queue");

        // Once the gate frees up the blocked submission goes through and
        // every job, including the one that waited, runs to completion.
        let last = blocked.await.unwrap();
        scheduler.close();
        assert!(scheduler.wait(Some(Duration::from_secs(30))).await);
        for job in [running, admitting, buffered, last] {
            assert_eq!(job.poll(), Some(0), "{} was dropped or failed", job.id());
        }
    }

    #[tokio::test]
    async fn test_fifo_heavy_job_not_starved_by_later_light_jobs() {
        // Capacity 2 fully occupied by two unit jobs, then a weight-2 job
        // with a light one queued behind it. The heavy job is retried in
        // place, so the light job must stay queued until the heavy one has
        // been admitted.
        let (scheduler, _shutdown) = scheduler(2);
        let a = scheduler.submit(sh("sleep 2")).await.unwrap();
        let b = scheduler.submit(sh("sleep 2")).await.unwrap();
        assert!(a.await_started(Some(Duration::from_secs(10))).await);
        assert!(b.await_started(Some(Duration::from_secs(10))).await);

        let heavy = scheduler.submit(sh("sleep 1").with_weight(2)).await.unwrap();
        let light = scheduler.submit(sh("exit 0")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(heavy.state(), JobState::Admitting);
        assert_eq!(light.state(), JobState::Pending);

        assert!(heavy.wait(Some(Duration::from_secs(20))).await);
        assert!(light.wait(Some(Duration::from_secs(20))).await);
        assert_eq!(heavy.poll(), Some(0));
        assert_eq!(light.poll(), Some(0));
        assert!(scheduler.wait(Some(Duration::from_secs(10))).await);
    }
}
