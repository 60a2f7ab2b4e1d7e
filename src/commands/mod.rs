//! HTTP surface. Handlers are thin: extract, call the engine or a repo,
//! return JSON. `AppError` maps to a status code here and nowhere else.

pub mod generation;
pub mod healing;
pub mod system;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::AppState;

pub type ApiResult<T> = Result<Json<T>, AppError>;

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::InvalidTransition(_) => StatusCode::CONFLICT,
            AppError::Provider(_)
            | AppError::ProviderResponse(_)
            | AppError::AllStrategiesFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Database(_)
            | AppError::Pool(_)
            | AppError::Io(_)
            | AppError::Serde(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "Request failed");
        } else {
            tracing::debug!(kind = self.kind(), error = %self, "Request rejected");
        }
        (status, Json(self)).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/generate", post(generation::generate))
        .route("/generate/performance", get(generation::strategy_performance))
        .route("/errors", post(healing::report_error).get(healing::list_errors))
        .route("/errors/{id}", get(healing::get_error))
        .route("/errors/{id}/fixes", get(healing::list_fixes))
        .route("/errors/{id}/audit", get(healing::list_audit))
        .route("/healing", post(healing::run_command))
        .route("/patterns", get(healing::list_patterns))
        .route("/validation-patterns", post(healing::learn_validation_pattern))
        .route("/schema/versions", get(system::list_schema_versions))
        .route("/schema/check", post(system::check_schema))
        .route("/health", get(system::health))
        .route("/status", get(system::status))
        .route("/crash-logs", get(system::crash_logs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl-C or `cancel` fires.
pub async fn serve(state: Arc<AppState>, cancel: CancellationToken) -> Result<(), AppError> {
    let addr: SocketAddr = state
        .config
        .server
        .bind
        .parse()
        .map_err(|e| AppError::Config(format!("server.bind '{}': {e}", state.config.server.bind)))?;

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Buildloop listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl-C received"),
                _ = cancel.cancelled() => {}
            }
            tracing::info!("HTTP server shutting down");
        })
        .await?;

    Ok(())
}
