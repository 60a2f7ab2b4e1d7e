use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::db::models::{
    AutoFix, DetectedError, ErrorPattern, ErrorStatus, ErrorType, HealingAuditEntry, Severity,
    ValidationPattern,
};
use crate::db::repos::healing::{audit as audit_repo, errors as error_repo, fixes as fix_repo};
use crate::engine::detector::ErrorReport;
use crate::engine::healing::{HealingCommand, HealingResponse, SuggestedFix};
use crate::engine::validation::{self, LearnValidationInput};
use crate::AppState;

use super::ApiResult;

const DEFAULT_PATTERN_LIMIT: i64 = 100;

/// Acknowledgement for a reported error.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorAck {
    pub error_id: String,
    pub error_type: ErrorType,
    pub severity: Severity,
    pub suggested_fix: Option<SuggestedFix>,
    pub background_healing: bool,
}

pub async fn report_error(
    State(state): State<Arc<AppState>>,
    Json(report): Json<ErrorReport>,
) -> ApiResult<ErrorAck> {
    let outcome = state.healing.detect_and_heal(&report)?;
    Ok(Json(ErrorAck {
        error_id: outcome.error.id,
        error_type: outcome.error.error_type,
        severity: outcome.error.severity,
        suggested_fix: outcome.suggested_fix,
        background_healing: outcome.background_healing,
    }))
}

pub async fn run_command(
    State(state): State<Arc<AppState>>,
    Json(command): Json<HealingCommand>,
) -> ApiResult<HealingResponse> {
    Ok(Json(state.healing.dispatch(command).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListErrorsQuery {
    pub status: Option<ErrorStatus>,
    pub limit: Option<i64>,
}

pub async fn list_errors(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListErrorsQuery>,
) -> ApiResult<Vec<DetectedError>> {
    Ok(Json(error_repo::list(&state.db, query.status, query.limit)?))
}

pub async fn get_error(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<DetectedError> {
    Ok(Json(error_repo::get_by_id(&state.db, &id)?))
}

pub async fn list_fixes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<AutoFix>> {
    error_repo::get_by_id(&state.db, &id)?;
    Ok(Json(fix_repo::list_for_error(&state.db, &id)?))
}

pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<HealingAuditEntry>> {
    error_repo::get_by_id(&state.db, &id)?;
    Ok(Json(audit_repo::list_for_error(&state.db, &id)?))
}

#[derive(Debug, Deserialize)]
pub struct PatternQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternListing {
    pub error_patterns: Vec<ErrorPattern>,
    pub validation_patterns: Vec<ValidationPattern>,
}

pub async fn list_patterns(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PatternQuery>,
) -> ApiResult<PatternListing> {
    let limit = query.limit.unwrap_or(DEFAULT_PATTERN_LIMIT);
    Ok(Json(PatternListing {
        error_patterns: state.patterns.list_error_patterns(limit)?,
        validation_patterns: state.patterns.list_validation_patterns(limit)?,
    }))
}

pub async fn learn_validation_pattern(
    State(state): State<Arc<AppState>>,
    Json(input): Json<LearnValidationInput>,
) -> ApiResult<ValidationPattern> {
    Ok(Json(validation::learn_validation_pattern(&state.patterns, &input)?))
}
