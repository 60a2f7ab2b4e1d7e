//! Fire-and-forget work and background loop state.
//!
//! [`BackgroundTasks`] is the explicit queue for work nobody waits on:
//! telemetry writes, background healing, audit entries. Every job is named;
//! failures are logged and pushed onto an error channel so they stay visible
//! without ever reaching the original caller.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Notify};

use crate::error::AppError;

// ============================================================================
// Scheduler state (background loops)
// ============================================================================

/// Runtime state for the subscription loops, shared across tasks.
pub struct SchedulerState {
    running: AtomicBool,
    schema_ticks: AtomicU64,
    schema_ticks_skipped: AtomicU64,
    schema_changes_detected: AtomicU64,
    cleanup_runs: AtomicU64,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            schema_ticks: AtomicU64::new(0),
            schema_ticks_skipped: AtomicU64::new(0),
            schema_changes_detected: AtomicU64::new(0),
            cleanup_runs: AtomicU64::new(0),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Relaxed);
        tracing::info!("Background loops starting");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        tracing::info!("Background loops stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn record_schema_tick(&self, changed: bool) {
        self.schema_ticks.fetch_add(1, Ordering::Relaxed);
        if changed {
            self.schema_changes_detected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_schema_skip(&self) {
        self.schema_ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cleanup(&self) {
        self.cleanup_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.running.load(Ordering::Relaxed),
            schema_ticks: self.schema_ticks.load(Ordering::Relaxed),
            schema_ticks_skipped: self.schema_ticks_skipped.load(Ordering::Relaxed),
            schema_changes_detected: self.schema_changes_detected.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub running: bool,
    pub schema_ticks: u64,
    pub schema_ticks_skipped: u64,
    pub schema_changes_detected: u64,
    pub cleanup_runs: u64,
}

// ============================================================================
// Background task queue
// ============================================================================

/// A background job that returned an error or panicked.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub job: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
}

pub struct BackgroundTasks {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    idle: Notify,
    errors: mpsc::UnboundedSender<TaskFailure>,
}

impl BackgroundTasks {
    /// Create the queue and the receiving end of its error channel.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TaskFailure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tasks = Arc::new(Self {
            spawned: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            idle: Notify::new(),
            errors: tx,
        });
        (tasks, rx)
    }

    /// Run an async job on the runtime.
    pub fn spawn<F>(self: &Arc<Self>, job: &'static str, fut: F)
    where
        F: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        self.begin();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tokio::spawn(fut).await;
            this.finish(job, outcome);
        });
    }

    /// Run blocking work (database writes) on the blocking pool.
    pub fn spawn_blocking<F>(self: &Arc<Self>, job: &'static str, f: F)
    where
        F: FnOnce() -> Result<(), AppError> + Send + 'static,
    {
        self.begin();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(f).await;
            this.finish(job, outcome);
        });
    }

    /// Resolve once no job is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            spawned: self.spawned.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }

    fn begin(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self, job: &'static str, outcome: Result<Result<(), AppError>, tokio::task::JoinError>) {
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(join) => Some(format!("task panicked or was cancelled: {join}")),
        };

        match error {
            None => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Some(error) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(job, error = %error, "Background job failed");
                // Receiver may be gone during shutdown.
                let _ = self.errors.send(TaskFailure { job, error });
            }
        }

        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Drain the error channel into the log until every sender is dropped.
pub async fn drain_failures(mut rx: mpsc::UnboundedReceiver<TaskFailure>) {
    while let Some(failure) = rx.recv().await {
        tracing::error!(job = failure.job, error = %failure.error, "Background job failure reported");
    }
}
