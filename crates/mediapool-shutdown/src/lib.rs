//! Process-wide cooperative shutdown coordination.
//!
//! Two monotonic flags (interrupt and terminate) are the sole cancellation
//! primitive in mediapool: every blocking loop in the gate, job, and
//! scheduler crates polls them between bounded waits, so a signal causes a
//! prompt, orderly unwind instead of a hang or a hard kill of in-flight work.
//!
//! The flags are always carried as an injected `Arc<ShutdownFlags>` rather
//! than module-level state, so independent scheduler instances in one process
//! (notably under test) do not interfere with each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Monotonic interrupt/terminate indicators shared across the process pool.
///
/// Both flags start unset, are set at most once each (setting again is a
/// no-op), and are never cleared. A watch channel backs [`ShutdownFlags::wait`]
/// so callers that want to block do so efficiently instead of spinning.
#[derive(Debug)]
pub struct ShutdownFlags {
    interrupt: AtomicBool,
    terminate: AtomicBool,
    tx: watch::Sender<bool>,
}

impl ShutdownFlags {
    /// Creates a fresh pair of unset flags.
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = watch::channel(false);
        Arc::new(Self {
            interrupt: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            tx,
        })
    }

    /// Records an interrupt request (SIGINT / Ctrl+C).
    pub fn request_interrupt(&self) {
        if !self.interrupt.swap(true, Ordering::SeqCst) {
            info!("interrupt requested; unwinding in-flight work");
            let _ = self.tx.send(true);
        }
    }

    /// Records a terminate request (SIGTERM).
    pub fn request_terminate(&self) {
        if !self.terminate.swap(true, Ordering::SeqCst) {
            info!("terminate requested; unwinding in-flight work");
            let _ = self.tx.send(true);
        }
    }

    /// Returns true if an interrupt has been requested.
    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Returns true if a terminate has been requested.
    pub fn terminate_requested(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Returns true if either flag has been set.
    pub fn shutdown_requested(&self) -> bool {
        self.interrupt_requested() || self.terminate_requested()
    }

    /// Blocks until shutdown is requested or `timeout` elapses.
    ///
    /// Returns whether shutdown had been requested by the time the call
    /// returned. `None` waits indefinitely.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.shutdown_requested() {
            return true;
        }
        let mut rx = self.tx.subscribe();
        let changed = rx.wait_for(|set| *set);
        match timeout {
            Some(d) => tokio::time::timeout(d, changed).await.is_ok(),
            None => {
                let _ = changed.await;
                true
            }
        }
    }
}

/// Installs OS signal handlers that set the matching shutdown flag.
///
/// Fire-and-forget: the spawned task listens for the remaining process
/// lifetime. On Unix, SIGINT sets the interrupt flag and SIGTERM the
/// terminate flag; elsewhere Ctrl+C sets the interrupt flag.
pub fn install_signal_handlers(flags: Arc<ShutdownFlags>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("failed to install SIGINT handler: {}", e);
                    return;
                }
            };
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("failed to install SIGTERM handler: {}", e);
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = sigint.recv() => flags.request_interrupt(),
                    _ = sigterm.recv() => flags.request_terminate(),
                }
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                flags.request_interrupt();
            }
        }
    });
}
