use serde::{Deserialize, Serialize};

// ============================================================================
// Classification enums
// ============================================================================

crate::sql_text_enum! {
    /// Severity of a detected error or schema change. Ordered low → critical.
    pub enum Severity {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

crate::sql_text_enum! {
    /// Fixed error taxonomy used for pattern lookup.
    pub enum ErrorType {
        TypeError => "TypeError",
        ReferenceError => "ReferenceError",
        SyntaxError => "SyntaxError",
        RangeError => "RangeError",
        NetworkError => "NetworkError",
        TimeoutError => "TimeoutError",
        PermissionError => "PermissionError",
        UnknownError => "UnknownError",
    }
}

crate::sql_text_enum! {
    pub enum ErrorStatus {
        Detected => "detected",
        Analyzing => "analyzing",
        Fixing => "fixing",
        Fixed => "fixed",
        FixedAuto => "fixed_auto",
        Failed => "failed",
    }
}

impl ErrorStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorStatus::Fixed | ErrorStatus::FixedAuto | ErrorStatus::Failed)
    }
}

crate::sql_text_enum! {
    pub enum FixType {
        CodePatch => "code_patch",
        Migration => "migration",
        ConfigChange => "config_change",
        AiGenerated => "ai_generated",
    }
}

crate::sql_text_enum! {
    pub enum FixStatus {
        Pending => "pending",
        Applied => "applied",
        Verified => "verified",
        Failed => "failed",
        RolledBack => "rolled_back",
    }
}

// ============================================================================
// Detected errors
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedError {
    pub id: String,
    pub error_type: ErrorType,
    pub severity: Severity,
    pub status: ErrorStatus,
    pub message: String,
    pub stack_trace: Option<String>,
    /// Caller-supplied context, stored as JSON text.
    pub context: Option<String>,
    pub signature: String,
    pub fix_attempt_count: u32,
    pub auto_fix_disabled: bool,
    /// Canonical code for the failing unit: the fixed code after apply,
    /// the original code after rollback.
    pub current_code: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateDetectedErrorInput {
    pub error_type: ErrorType,
    pub severity: Severity,
    pub message: String,
    pub stack_trace: Option<String>,
    pub context: Option<String>,
    pub signature: String,
}

// ============================================================================
// Auto fixes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoFix {
    pub id: String,
    pub error_id: String,
    pub fix_type: FixType,
    pub original_code: String,
    pub fixed_code: String,
    pub explanation: Option<String>,
    pub confidence: f64,
    pub status: FixStatus,
    /// Signature of the learned pattern the fix was built from, if any.
    pub pattern_signature: Option<String>,
    /// Confidence cleared the auto-apply threshold at generation time.
    pub auto_apply_eligible: bool,
    pub test_results: Option<String>,
    pub rollback_reason: Option<String>,
    pub applied_at: Option<String>,
    pub verified_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct CreateAutoFixInput {
    pub error_id: String,
    pub fix_type: FixType,
    pub original_code: String,
    pub fixed_code: String,
    pub explanation: Option<String>,
    pub confidence: f64,
    pub pattern_signature: Option<String>,
    pub auto_apply_eligible: bool,
}

// ============================================================================
// Audit trail
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingAuditEntry {
    pub id: String,
    pub error_id: String,
    pub fix_id: Option<String>,
    pub event: String,
    pub detail: Option<String>,
    pub created_at: String,
}
