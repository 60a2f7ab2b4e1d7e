use serde::{Deserialize, Serialize};

use super::ErrorType;

// ============================================================================
// Error patterns (error signature → fix)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPattern {
    pub signature: String,
    pub category: ErrorType,
    pub description: String,
    pub solution_template: String,
    pub success_count: i64,
    pub failure_count: i64,
    pub confidence: f64,
    pub created_at: String,
    pub updated_at: String,
}

// ============================================================================
// Validation patterns (artifact validation issue → fix)
// ============================================================================

crate::sql_text_enum! {
    /// Structural issues found in a generated file set.
    pub enum ValidationIssueKind {
        EmptyFile => "empty_file",
        MissingEntryPoint => "missing_entry_point",
        MissingManifest => "missing_manifest",
        OversizedFile => "oversized_file",
        UnbalancedDelimiters => "unbalanced_delimiters",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationPattern {
    pub signature: String,
    pub issue_type: ValidationIssueKind,
    pub description: String,
    pub fix_template: String,
    pub success_count: i64,
    pub failure_count: i64,
    pub confidence: f64,
    pub created_at: String,
    pub updated_at: String,
}
