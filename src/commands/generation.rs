use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::db::models::{ExecutionMode, StrategyPerformance};
use crate::db::repos::generation::telemetry as telemetry_repo;
use crate::engine::types::{GenerationOutcome, GenerationRequest};
use crate::AppState;

use super::ApiResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    pub request: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub parallel_execution: bool,
}

pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateBody>,
) -> ApiResult<GenerationOutcome> {
    let mode = if body.parallel_execution {
        ExecutionMode::Parallel
    } else {
        ExecutionMode::Sequential
    };
    let request = GenerationRequest::new(body.request, body.context);
    let outcome = state.executor.execute(&request, mode).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct PerformanceQuery {
    pub days: Option<i64>,
}

/// Per provider/approach success rate and mean score over the window.
pub async fn strategy_performance(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PerformanceQuery>,
) -> ApiResult<Vec<StrategyPerformance>> {
    let days = query.days.unwrap_or(state.config.retention.telemetry_days).max(1);
    Ok(Json(telemetry_repo::strategy_performance(&state.db, days)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::state_with;
    use crate::db::models::ProviderKind;
    use crate::engine::executor::testing::{good_files, Script, ScriptedGenerator};
    use crate::error::AppError;

    #[tokio::test]
    async fn test_generate_returns_winner_and_alternates() {
        let state = state_with(ScriptedGenerator::with(&[
            (ProviderKind::Fast, Script::Fail("overloaded")),
            (ProviderKind::Standard, Script::Files(good_files())),
        ]));

        let body = GenerateBody {
            request: "a landing page".into(),
            context: None,
            parallel_execution: false,
        };
        let Json(outcome) = generate(State(state.clone()), Json(body)).await.unwrap();
        assert_eq!(outcome.winner.strategy.provider, ProviderKind::Standard);
        assert_eq!(outcome.alternates.len(), 1);
        assert!(!outcome.alternates[0].succeeded);

        state.tasks.wait_idle().await;
        let Json(perf) = strategy_performance(State(state), Query(PerformanceQuery { days: None }))
            .await
            .unwrap();
        assert_eq!(perf.len(), 2);
    }

    #[tokio::test]
    async fn test_generate_all_failed_is_error() {
        let state = state_with(ScriptedGenerator::default());
        let body: GenerateBody =
            serde_json::from_value(serde_json::json!({ "request": "x", "parallelExecution": true })).unwrap();
        assert!(body.parallel_execution);

        let err = generate(State(state), Json(body)).await.unwrap_err();
        assert!(matches!(err, AppError::AllStrategiesFailed(_)));
    }
}
