//! mediapool - run a batch of external commands through the weighted
//! process scheduler.
//!
//! Reads a YAML list of job descriptors, submits them all, and waits for the
//! pool to drain. SIGINT/SIGTERM trigger a cooperative unwind: in-flight
//! processes are terminated and queued ones discarded.

use anyhow::{Context, Result};
use clap::Parser;
use mediapool_process::JobSpec;
use mediapool_scheduler::{JobScheduler, SchedulerConfig};
use mediapool_shutdown::{install_signal_handlers, ShutdownFlags};
use tracing::{info, warn};

/// Weighted external-process pool runner.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML file containing the list of jobs to run
    #[arg(value_name = "JOBS_FILE")]
    jobs: String,

    /// Total concurrency slots (defaults to the logical CPU count)
    #[arg(short, long)]
    capacity: Option<u32>,

    /// Queue depth bound; submissions block when the queue is full
    #[arg(short, long)]
    queue_depth: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging(args.debug);

    let raw = std::fs::read_to_string(&args.jobs)
        .with_context(|| format!("failed to read jobs file {}", args.jobs))?;
    let specs: Vec<JobSpec> =
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", args.jobs))?;
    if specs.is_empty() {
        warn!("jobs file {} contains no jobs", args.jobs);
        return Ok(());
    }
    info!("loaded {} jobs from {}", specs.len(), args.jobs);

    let mut config = SchedulerConfig::default();
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    if let Some(depth) = args.queue_depth {
        config.queue_depth = depth;
    }

    let shutdown = ShutdownFlags::new();
    install_signal_handlers(shutdown.clone());

    let scheduler = JobScheduler::new(config, shutdown);
    let mut jobs = Vec::with_capacity(specs.len());
    for spec in specs {
        let job = scheduler
            .submit(spec)
            .await
            .context("job submission rejected")?;
        jobs.push(job);
    }
    scheduler.close();
    scheduler.wait(None).await;

    let mut failures = 0usize;
    for job in &jobs {
        let started = job
            .started_at()
            .map(|t| t.format("%H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| "never started".into());
        match job.poll() {
            Some(0) => info!(
                "{}: {} -> ok (started {})",
                job.id(),
                job.spec().command_line(),
                started
            ),
            Some(code) => {
                warn!(
                    "{}: {} -> exit {} (started {})",
                    job.id(),
                    job.spec().command_line(),
                    code,
                    started
                );
                failures += 1;
            }
            None => {
                warn!(
                    "{}: {} -> {}",
                    job.id(),
                    job.spec().command_line(),
                    job.state()
                );
                failures += 1;
            }
        }
    }

    if failures > 0 {
        warn!("{} of {} jobs did not exit cleanly", failures, jobs.len());
        std::process::exit(1);
    }
    info!("all {} jobs exited cleanly", jobs.len());
    Ok(())
}

fn initialize_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();
}
