pub mod commands;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod notifications;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use config::AppConfig;
use db::DbPool;
use engine::background::{BackgroundTasks, SchedulerState, TaskFailure};
use engine::executor::GenerationExecutor;
use engine::failover::ProviderCircuitBreaker;
use engine::healing::HealingPipeline;
use engine::patterns::PatternStore;
use engine::provider::{FixGenerationCapability, GenerationCapability, HttpProvider};
use engine::schema_monitor::{SchemaChangeMonitor, SchemaSource, SqliteSchemaSource};
use engine::subscription::{
    spawn_subscriptions, ReactiveSubscription, SchemaMonitorSubscription,
    TelemetryCleanupSubscription,
};
use error::AppError;
use notifications::{FanoutNotifier, LogNotifier, Notifier, WebhookNotifier};

/// How long shutdown waits for queued background jobs.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// External collaborators, injected so tests can swap them for fakes.
pub struct Services {
    pub generator: Arc<dyn GenerationCapability>,
    pub fixer: Arc<dyn FixGenerationCapability>,
    pub notifier: Arc<dyn Notifier>,
    /// Watched database; schema monitoring is off when `None`.
    pub schema_source: Option<Arc<dyn SchemaSource>>,
}

/// Shared application state accessible from all HTTP handlers.
pub struct AppState {
    pub config: AppConfig,
    pub data_dir: PathBuf,
    pub db: DbPool,
    pub executor: Arc<GenerationExecutor>,
    pub healing: Arc<HealingPipeline>,
    pub patterns: Arc<PatternStore>,
    pub scheduler: Arc<SchedulerState>,
    pub tasks: Arc<BackgroundTasks>,
    pub schema_monitor: Option<Arc<SchemaChangeMonitor>>,
}

impl AppState {
    /// Wire the engine together. The receiver is the background queue's
    /// error channel; the caller decides who drains it.
    pub fn new(
        config: AppConfig,
        db: DbPool,
        services: Services,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TaskFailure>) {
        let (tasks, failures) = BackgroundTasks::new();
        let thresholds = config.thresholds;
        let patterns = Arc::new(PatternStore::new(db.clone(), thresholds));

        let executor = Arc::new(GenerationExecutor::new(
            db.clone(),
            services.generator,
            Arc::new(ProviderCircuitBreaker::new()),
            patterns.clone(),
            tasks.clone(),
            thresholds,
            config.scoring,
            config.strategies.clone(),
        ));

        let healing = Arc::new(HealingPipeline::new(
            db.clone(),
            patterns.clone(),
            services.fixer,
            services.notifier,
            tasks.clone(),
            thresholds,
        ));

        let schema_monitor = services
            .schema_source
            .map(|source| Arc::new(SchemaChangeMonitor::new(db.clone(), source)));

        let state = Arc::new(Self {
            data_dir: config.data_dir(),
            config,
            db,
            executor,
            healing,
            patterns,
            scheduler: Arc::new(SchedulerState::new()),
            tasks,
            schema_monitor,
        });
        (state, failures)
    }
}

fn build_notifier(config: &AppConfig) -> Arc<dyn Notifier> {
    let mut sinks: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = &config.notifications.webhook_url {
        match WebhookNotifier::new(url.clone()) {
            Ok(hook) => sinks.push(Arc::new(hook)),
            Err(e) => tracing::warn!(error = %e, "Webhook notifier disabled"),
        }
    }
    Arc::new(FanoutNotifier::new(sinks))
}

fn build_schema_source(config: &AppConfig) -> Option<Arc<dyn SchemaSource>> {
    if !config.schema_monitor.enabled {
        return None;
    }
    let path = config.schema_monitor.target_db.as_ref()?;
    match db::open_external(path) {
        Ok(pool) => Some(Arc::new(SqliteSchemaSource::new(pool))),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Schema monitoring disabled");
            None
        }
    }
}

/// Load configuration, start background loops and serve HTTP until Ctrl-C.
pub async fn run() -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let _log_guard = logging::init(&data_dir);
    logging::install_crash_hook(&data_dir);
    tracing::info!("Starting Buildloop v{}", env!("CARGO_PKG_VERSION"));

    let pool = db::init_db(&data_dir)?;
    let provider = Arc::new(HttpProvider::new(&config.provider)?);
    let services = Services {
        generator: provider.clone(),
        fixer: provider,
        notifier: build_notifier(&config),
        schema_source: build_schema_source(&config),
    };

    let (state, failures) = AppState::new(config, pool, services);
    tokio::spawn(engine::background::drain_failures(failures));

    let mut subscriptions: Vec<Box<dyn ReactiveSubscription>> = vec![Box::new(TelemetryCleanupSubscription {
        pool: state.db.clone(),
        scheduler: state.scheduler.clone(),
        retention_days: state.config.retention.telemetry_days,
    })];
    if let Some(monitor) = &state.schema_monitor {
        state.patterns.spawn_signal_listener(monitor.subscribe());
        subscriptions.push(Box::new(SchemaMonitorSubscription {
            monitor: monitor.clone(),
            scheduler: state.scheduler.clone(),
            interval: Duration::from_secs(state.config.schema_monitor.interval_secs),
        }));
    }

    let cancel = CancellationToken::new();
    let loops = spawn_subscriptions(subscriptions, state.scheduler.clone(), cancel.clone());

    let served = commands::serve(state.clone(), cancel.clone()).await;

    cancel.cancel();
    state.scheduler.stop();
    for handle in loops {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Background loop ended abnormally");
        }
    }
    if tokio::time::timeout(SHUTDOWN_DRAIN, state.tasks.wait_idle()).await.is_err() {
        tracing::warn!(in_flight = state.tasks.stats().in_flight, "Shutdown with background jobs still running");
    }

    tracing::info!("Buildloop stopped");
    served
}
