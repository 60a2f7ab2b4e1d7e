use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::db::models::SchemaVersion;
use crate::db::repos::schema::versions as version_repo;
use crate::engine::background::{SchedulerStats, TaskStats};
use crate::engine::failover::CircuitSnapshot;
use crate::engine::patterns::PatternStoreStats;
use crate::engine::schema_monitor::TickOutcome;
use crate::error::AppError;
use crate::logging::{self, CrashLogEntry};
use crate::AppState;

use super::ApiResult;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub version: &'static str,
    pub scheduler: SchedulerStats,
    pub tasks: TaskStats,
    pub patterns: PatternStoreStats,
    pub circuits: Vec<CircuitSnapshot>,
    pub schema_monitor_enabled: bool,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        scheduler: state.scheduler.stats(),
        tasks: state.tasks.stats(),
        patterns: state.patterns.stats(),
        circuits: state.executor.breaker().snapshot(),
        schema_monitor_enabled: state.schema_monitor.is_some(),
    })
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

pub async fn list_schema_versions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<SchemaVersion>> {
    Ok(Json(version_repo::list(&state.db, query.limit.unwrap_or(50))?))
}

/// Run one monitor tick now, outside the regular interval.
pub async fn check_schema(State(state): State<Arc<AppState>>) -> ApiResult<TickOutcome> {
    let monitor = state
        .schema_monitor
        .as_ref()
        .ok_or_else(|| AppError::NotFound("schema monitor is not configured".into()))?;
    let outcome = monitor.check_once().await?;
    match &outcome {
        TickOutcome::Skipped => state.scheduler.record_schema_skip(),
        TickOutcome::Changed { .. } => state.scheduler.record_schema_tick(true),
        TickOutcome::Baseline { .. } | TickOutcome::Unchanged => state.scheduler.record_schema_tick(false),
    }
    Ok(Json(outcome))
}

pub async fn crash_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<CrashLogEntry>> {
    let limit = query.limit.unwrap_or(10).clamp(1, 100) as usize;
    Json(logging::read_crash_logs(&state.data_dir, limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::state_with;

    #[tokio::test]
    async fn test_status_reports_all_circuits() {
        let state = state_with(Default::default());
        let Json(status) = status(State(state)).await;
        assert_eq!(status.circuits.len(), 3);
        assert!(!status.schema_monitor_enabled);
        assert!(!status.scheduler.running);
    }

    #[tokio::test]
    async fn test_check_schema_without_monitor_is_not_found() {
        let state = state_with(Default::default());
        let err = check_schema(State(state)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_schema_versions_empty() {
        let state = state_with(Default::default());
        let Json(versions) = list_schema_versions(State(state), Query(LimitQuery { limit: None }))
            .await
            .unwrap();
        assert!(versions.is_empty());
    }
}
