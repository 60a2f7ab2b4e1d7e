use serde::{Deserialize, Serialize};

crate::sql_text_enum! {
    /// Generation backends, ordered by capability.
    pub enum ProviderKind {
        Flagship => "flagship",
        Standard => "standard",
        Fast => "fast",
    }
}

crate::sql_text_enum! {
    pub enum Approach {
        Progressive => "progressive",
        Simple => "simple",
        Hybrid => "hybrid",
    }
}

crate::sql_text_enum! {
    pub enum ExecutionMode {
        Sequential => "sequential",
        Parallel => "parallel",
    }
}

/// One persisted strategy attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTelemetry {
    pub id: String,
    pub request_id: String,
    pub provider: ProviderKind,
    pub approach: Approach,
    pub timeout_ms: i64,
    pub priority: i64,
    pub mode: ExecutionMode,
    pub succeeded: bool,
    pub quality_score: i64,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub file_count: i64,
    pub is_winner: bool,
    /// Only stored for the winning attempt.
    pub files_json: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct CreateTelemetryInput {
    pub request_id: String,
    pub provider: ProviderKind,
    pub approach: Approach,
    pub timeout_ms: u64,
    pub priority: u32,
    pub mode: ExecutionMode,
    pub succeeded: bool,
    pub quality_score: i32,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub file_count: usize,
    pub is_winner: bool,
    pub files_json: Option<String>,
}

/// Aggregated per-strategy performance for offline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyPerformance {
    pub provider: ProviderKind,
    pub approach: Approach,
    pub attempts: i64,
    pub successes: i64,
    pub wins: i64,
    pub avg_quality_score: f64,
    pub avg_duration_ms: f64,
}
