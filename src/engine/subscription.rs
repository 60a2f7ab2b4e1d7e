//! Periodic background loops.
//!
//! Each loop is a [`ReactiveSubscription`]: a name, an interval, an optional
//! startup delay and a `tick`. [`spawn_subscriptions`] gives every
//! subscription its own task; all of them stop on the shared cancellation
//! token or when the scheduler is stopped.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::repos::generation::telemetry as telemetry_repo;
use crate::db::DbPool;
use crate::engine::background::SchedulerState;
use crate::engine::schema_monitor::{SchemaChangeMonitor, TickOutcome};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait ReactiveSubscription: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Delay before the first poll.
    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// One poll cycle. Errors are logged internally; the loop continues.
    async fn tick(&self);
}

// ---------------------------------------------------------------------------
// Concrete subscriptions
// ---------------------------------------------------------------------------

/// Runs the schema change monitor on its fixed interval.
pub struct SchemaMonitorSubscription {
    pub monitor: Arc<SchemaChangeMonitor>,
    pub scheduler: Arc<SchedulerState>,
    pub interval: Duration,
}

/// Deletes generation telemetry older than the retention window.
pub struct TelemetryCleanupSubscription {
    pub pool: DbPool,
    pub scheduler: Arc<SchedulerState>,
    pub retention_days: i64,
}

#[async_trait::async_trait]
impl ReactiveSubscription for SchemaMonitorSubscription {
    fn name(&self) -> &'static str {
        "schema_monitor"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) {
        match self.monitor.check_once().await {
            Ok(TickOutcome::Skipped) => self.scheduler.record_schema_skip(),
            Ok(TickOutcome::Changed { .. }) => self.scheduler.record_schema_tick(true),
            Ok(TickOutcome::Baseline { .. } | TickOutcome::Unchanged) => {
                self.scheduler.record_schema_tick(false)
            }
            Err(e) => tracing::warn!(error = %e, "Schema check failed"),
        }
    }
}

#[async_trait::async_trait]
impl ReactiveSubscription for TelemetryCleanupSubscription {
    fn name(&self) -> &'static str {
        "telemetry_cleanup"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(24 * 3600)
    }

    fn initial_delay(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn tick(&self) {
        let pool = self.pool.clone();
        let days = self.retention_days;
        match tokio::task::spawn_blocking(move || telemetry_repo::cleanup(&pool, days)).await {
            Ok(Ok(deleted)) => {
                self.scheduler.record_cleanup();
                if deleted > 0 {
                    tracing::info!(deleted, retention_days = days, "Old telemetry removed");
                }
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "Telemetry cleanup failed"),
            Err(e) => tracing::warn!(error = %e, "Telemetry cleanup task panicked"),
        }
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Drive one subscription until cancelled or the scheduler stops.
async fn run_single(
    sub: Box<dyn ReactiveSubscription>,
    scheduler: Arc<SchedulerState>,
    cancel: CancellationToken,
) {
    let name = sub.name();
    let delay = sub.initial_delay();
    if !delay.is_zero() {
        tracing::debug!(subscription = name, delay_secs = delay.as_secs(), "Delaying initial poll");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let mut interval = tokio::time::interval(sub.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if !scheduler.is_running() {
            break;
        }
        sub.tick().await;
    }
    tracing::info!(subscription = name, "Subscription loop exited");
}

pub fn spawn_subscriptions(
    subscriptions: Vec<Box<dyn ReactiveSubscription>>,
    scheduler: Arc<SchedulerState>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    scheduler.start();
    subscriptions
        .into_iter()
        .map(|sub| tokio::spawn(run_single(sub, scheduler.clone(), cancel.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::db::init_test_db;
    use crate::engine::schema_monitor::testing::{table, StaticSchemaSource};

    struct CountingSubscription {
        ticks: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl ReactiveSubscription for CountingSubscription {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(50)
        }

        async fn tick(&self) {
            self.ticks.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ticks_until_cancelled() {
        let ticks = Arc::new(AtomicU32::new(0));
        let scheduler = Arc::new(SchedulerState::new());
        let cancel = CancellationToken::new();
        let handles = spawn_subscriptions(
            vec![Box::new(CountingSubscription { ticks: ticks.clone() })],
            scheduler.clone(),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(175)).await;
        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
        // Immediate first tick plus three more.
        assert_eq!(ticks.load(Ordering::Relaxed), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_exits_when_scheduler_stops() {
        let ticks = Arc::new(AtomicU32::new(0));
        let scheduler = Arc::new(SchedulerState::new());
        let handles = spawn_subscriptions(
            vec![Box::new(CountingSubscription { ticks: ticks.clone() })],
            scheduler.clone(),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.stop();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(ticks.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_schema_subscription_records_ticks() {
        let pool = init_test_db().unwrap();
        let source = Arc::new(StaticSchemaSource::default());
        source.set(vec![table("users", &[("id", "INTEGER")])]);
        let monitor = Arc::new(SchemaChangeMonitor::new(pool, source.clone()));
        let scheduler = Arc::new(SchedulerState::new());
        let sub = SchemaMonitorSubscription {
            monitor,
            scheduler: scheduler.clone(),
            interval: Duration::from_secs(300),
        };

        sub.tick().await;
        sub.tick().await;
        source.set(vec![table("users", &[("id", "INTEGER"), ("email", "TEXT")])]);
        sub.tick().await;

        let stats = scheduler.stats();
        assert_eq!(stats.schema_ticks, 3);
        assert_eq!(stats.schema_changes_detected, 1);
    }

    #[tokio::test]
    async fn test_cleanup_subscription_counts_runs() {
        let scheduler = Arc::new(SchedulerState::new());
        let sub = TelemetryCleanupSubscription {
            pool: init_test_db().unwrap(),
            scheduler: scheduler.clone(),
            retention_days: 30,
        };
        sub.tick().await;
        assert_eq!(scheduler.stats().cleanup_runs, 1);
    }
}
