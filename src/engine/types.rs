use serde::{Deserialize, Serialize};

use crate::db::models::{Approach, ExecutionMode, ProviderKind};

use super::validation::ValidationIssue;

// ============================================================================
// Strategies
// ============================================================================

/// One way of attempting a generation: which backend, how, and for how long.
/// Built per request and never persisted on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStrategy {
    pub provider: ProviderKind,
    pub approach: Approach,
    pub timeout_ms: u64,
    /// 1 = highest.
    pub priority: u32,
}

// ============================================================================
// Requests and provider output
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

impl GenerationRequest {
    pub fn new(text: impl Into<String>, context: Option<serde_json::Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            context,
        }
    }

    /// Whitespace-separated token count of the request text.
    pub fn token_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    /// True when a context value is present and carries something.
    pub fn has_context(&self) -> bool {
        match &self.context {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
            Some(serde_json::Value::Object(m)) => !m.is_empty(),
            Some(serde_json::Value::Array(a)) => !a.is_empty(),
            Some(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// What a generation backend hands back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratedOutput {
    pub files: Vec<GeneratedFile>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of one strategy attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub succeeded: bool,
    pub files: Vec<GeneratedFile>,
    pub quality_score: i32,
    pub strategy: GenerationStrategy,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

impl GenerationResult {
    pub fn failed(strategy: GenerationStrategy, duration_ms: u64, message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            files: Vec::new(),
            quality_score: 0,
            strategy,
            duration_ms,
            error_message: Some(message.into()),
        }
    }
}

/// Comparative score of a non-winning attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlternateScore {
    pub provider: ProviderKind,
    pub approach: Approach,
    pub priority: u32,
    pub succeeded: bool,
    pub quality_score: i32,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

impl From<&GenerationResult> for AlternateScore {
    fn from(r: &GenerationResult) -> Self {
        Self {
            provider: r.strategy.provider,
            approach: r.strategy.approach,
            priority: r.strategy.priority,
            succeeded: r.succeeded,
            quality_score: r.quality_score,
            duration_ms: r.duration_ms,
            error_message: r.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutcome {
    pub request_id: String,
    pub mode: ExecutionMode,
    pub winner: GenerationResult,
    pub alternates: Vec<AlternateScore>,
    pub attempts: usize,
    pub validation_issues: Vec<ValidationIssue>,
}
