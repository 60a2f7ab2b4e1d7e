//! Error classification and signatures.
//!
//! Classification is keyword-based and pure. The signature is what ties a
//! new error to learned patterns, so it must be stable across occurrences
//! that differ only in ids, numbers or quoted values.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::models::{CreateDetectedErrorInput, DetectedError, ErrorType, Severity};
use crate::db::repos::healing::errors as error_repo;
use crate::db::DbPool;
use crate::error::AppError;

const MAX_NORMALIZED_LEN: usize = 200;

/// An error as reported by a running application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub message: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    /// Source of the failing unit, when the reporter has it.
    #[serde(default)]
    pub code: Option<String>,
}

pub fn classify_severity(message: &str) -> Severity {
    let lower = message.to_lowercase();

    if ["critical", "fatal", "crash"].iter().any(|k| lower.contains(k)) {
        return Severity::Critical;
    }
    if ["error", "exception", "failed"].iter().any(|k| lower.contains(k)) {
        return Severity::High;
    }
    if ["warning", "deprecated"].iter().any(|k| lower.contains(k)) {
        return Severity::Medium;
    }
    Severity::Low
}

/// Match the message against the taxonomy names, then a few common
/// runtime phrasings that do not carry an explicit type name.
pub fn classify_error_type(message: &str) -> ErrorType {
    for kind in ErrorType::ALL {
        if *kind != ErrorType::UnknownError && message.contains(kind.as_str()) {
            return *kind;
        }
    }

    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        return ErrorType::TimeoutError;
    }
    if lower.contains("econnrefused")
        || lower.contains("failed to fetch")
        || lower.contains("network")
    {
        return ErrorType::NetworkError;
    }
    if lower.contains("permission denied") || lower.contains("eacces") || lower.contains("forbidden")
    {
        return ErrorType::PermissionError;
    }
    if lower.contains("is not defined") {
        return ErrorType::ReferenceError;
    }
    if lower.contains("unexpected token") {
        return ErrorType::SyntaxError;
    }

    ErrorType::UnknownError
}

fn normalizers() -> &'static [(Regex, &'static str)] {
    static NORMALIZERS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    NORMALIZERS.get_or_init(|| {
        [
            // quoted literals
            (r#""[^"]*"|'[^']*'|`[^`]*`"#, ""),
            // uuids and long hex ids
            (r"(?i)\b(?:0x)?[0-9a-f]{8,}(?:-[0-9a-f]{4,})*\b", ""),
            // remaining digits
            (r"\d+", ""),
            (r"\s+", " "),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
            Ok(re) => Some((re, replacement)),
            Err(e) => {
                tracing::error!(pattern, error = %e, "Invalid normalizer pattern");
                None
            }
        })
        .collect()
    })
}

/// Strip volatile parts of a description so repeated occurrences collide.
pub fn normalize_description(description: &str) -> String {
    let mut out = description.to_string();
    for (re, replacement) in normalizers() {
        out = re.replace_all(&out, *replacement).into_owned();
    }
    let out = out.trim().to_lowercase();
    out.chars().take(MAX_NORMALIZED_LEN).collect()
}

/// sha256 over `category` and the normalized description, hex encoded.
pub fn pattern_signature(category: &str, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize_description(description).as_bytes());
    hex::encode(hasher.finalize())
}

pub fn error_signature(error_type: ErrorType, message: &str) -> String {
    pattern_signature(error_type.as_str(), message)
}

/// Classify and persist a reported error in `detected` status.
pub fn record(pool: &DbPool, report: &ErrorReport) -> Result<DetectedError, AppError> {
    let severity = classify_severity(&report.message);
    let error_type = classify_error_type(&report.message);
    let signature = error_signature(error_type, &report.message);

    let context = match &report.context {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => Some(serde_json::to_string(v)?),
    };

    let detected = error_repo::create(
        pool,
        CreateDetectedErrorInput {
            error_type,
            severity,
            message: report.message.clone(),
            stack_trace: report.stack_trace.clone(),
            context,
            signature,
        },
    )?;

    tracing::info!(
        error_id = %detected.id,
        error_type = %error_type,
        severity = %severity,
        "Detected error recorded"
    );
    Ok(detected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn test_severity_keywords() {
        assert_eq!(classify_severity("FATAL: out of memory"), Severity::Critical);
        assert_eq!(classify_severity("renderer crash detected"), Severity::Critical);
        assert_eq!(classify_severity("Unhandled exception in worker"), Severity::High);
        assert_eq!(classify_severity("request failed"), Severity::High);
        assert_eq!(classify_severity("componentWillMount is deprecated"), Severity::Medium);
        assert_eq!(classify_severity("slow render"), Severity::Low);
    }

    #[test]
    fn test_type_error_scenario() {
        let msg = "TypeError: cannot read property 'x' of undefined";
        assert_eq!(classify_severity(msg), Severity::High);
        assert_eq!(classify_error_type(msg), ErrorType::TypeError);
    }

    #[test]
    fn test_error_type_fallbacks() {
        assert_eq!(classify_error_type("RangeError: invalid array length"), ErrorType::RangeError);
        assert_eq!(classify_error_type("request timed out after 30s"), ErrorType::TimeoutError);
        assert_eq!(classify_error_type("connect ECONNREFUSED 127.0.0.1"), ErrorType::NetworkError);
        assert_eq!(classify_error_type("EACCES: permission denied"), ErrorType::PermissionError);
        assert_eq!(classify_error_type("foo is not defined"), ErrorType::ReferenceError);
        assert_eq!(classify_error_type("something odd"), ErrorType::UnknownError);
    }

    #[test]
    fn test_signature_ignores_volatile_parts() {
        let a = error_signature(ErrorType::TypeError, "TypeError: cannot read property 'name' of undefined at line 12");
        let b = error_signature(ErrorType::TypeError, "TypeError:  cannot read property 'email' of undefined at line 99");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other = error_signature(ErrorType::RangeError, "TypeError: cannot read property 'name' of undefined at line 12");
        assert_ne!(a, other);
    }

    #[test]
    fn test_normalize_strips_ids_and_truncates() {
        let n = normalize_description("Order 550e8400-e29b-41d4-a716-446655440000 FAILED");
        assert_eq!(n, "order failed");
        assert_eq!(normalize_description(&"x".repeat(500)).len(), 200);
    }

    #[test]
    fn test_record_persists_classification() {
        let pool = init_test_db().unwrap();
        let report = ErrorReport {
            message: "TypeError: cannot read property 'x' of undefined".into(),
            stack_trace: None,
            context: Some(serde_json::json!({"route": "/home"})),
            code: None,
        };
        let e = record(&pool, &report).unwrap();
        assert_eq!(e.severity, Severity::High);
        assert_eq!(e.error_type, ErrorType::TypeError);
        assert_eq!(e.context.as_deref(), Some(r#"{"route":"/home"}"#));
    }
}
