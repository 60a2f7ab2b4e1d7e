//! Structural checks on a generated file set.
//!
//! Issue descriptions are path-free so that the same kind of problem in a
//! different file maps to the same learned validation pattern. The offending
//! path travels separately on the issue.

use serde::{Deserialize, Serialize};

use crate::config::ScoringLimits;
use crate::db::models::ValidationIssueKind;
use crate::error::AppError;

use super::detector::pattern_signature;
use super::patterns::PatternStore;
use super::quality::{file_name, is_entry_point, is_manifest};
use super::types::GeneratedFile;

/// Extensions checked for balanced brackets.
const BRACKETED_EXTENSIONS: &[&str] = &[
    "js", "jsx", "mjs", "cjs", "ts", "tsx", "rs", "go", "java", "kt", "c", "h", "cpp", "cs",
    "css", "scss", "json", "php", "swift",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub issue_type: ValidationIssueKind,
    pub path: Option<String>,
    pub description: String,
    pub signature: String,
    /// Learned fix, when a pattern is confident enough.
    pub suggested_fix: Option<String>,
    pub fix_confidence: Option<f64>,
}

impl ValidationIssue {
    fn new(issue_type: ValidationIssueKind, path: Option<&str>, description: String) -> Self {
        Self {
            issue_type,
            path: path.map(str::to_string),
            signature: pattern_signature(issue_type.as_str(), &description),
            description,
            suggested_fix: None,
            fix_confidence: None,
        }
    }
}

fn extension(path: &str) -> Option<String> {
    file_name(path).rsplit_once('.').map(|(_, ext)| ext.to_string())
}

fn balanced(content: &str) -> bool {
    let count = |c: char| content.chars().filter(|&x| x == c).count();
    count('{') == count('}') && count('(') == count(')') && count('[') == count(']')
}

/// Pure structural validation. An empty set yields no issues; the scorer
/// already gives it zero.
pub fn validate_artifacts(files: &[GeneratedFile], limits: &ScoringLimits) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if files.is_empty() {
        return issues;
    }

    if !files.iter().any(|f| is_entry_point(&f.path)) {
        issues.push(ValidationIssue::new(
            ValidationIssueKind::MissingEntryPoint,
            None,
            "no recognizable entry point".into(),
        ));
    }
    if !files.iter().any(|f| is_manifest(&f.path)) {
        issues.push(ValidationIssue::new(
            ValidationIssueKind::MissingManifest,
            None,
            "no dependency manifest".into(),
        ));
    }

    for f in files {
        let ext = extension(&f.path).unwrap_or_else(|| "none".into());
        if f.content.trim().is_empty() {
            issues.push(ValidationIssue::new(
                ValidationIssueKind::EmptyFile,
                Some(&f.path),
                format!("empty .{ext} file"),
            ));
            continue;
        }
        if f.content.len() > limits.max_mean_file_bytes {
            issues.push(ValidationIssue::new(
                ValidationIssueKind::OversizedFile,
                Some(&f.path),
                format!("oversized .{ext} file"),
            ));
        }
        if BRACKETED_EXTENSIONS.contains(&ext.as_str()) && !balanced(&f.content) {
            issues.push(ValidationIssue::new(
                ValidationIssueKind::UnbalancedDelimiters,
                Some(&f.path),
                format!("unbalanced delimiters in .{ext} file"),
            ));
        }
    }

    issues
}

/// Attach the best learned fix to each issue. Lookup failures leave the
/// issue without a suggestion.
pub fn enrich(store: &PatternStore, mut issues: Vec<ValidationIssue>) -> Vec<ValidationIssue> {
    for issue in &mut issues {
        match store.suggest_validation_fix(issue.issue_type, &issue.signature) {
            Ok(Some(pattern)) => {
                issue.suggested_fix = Some(pattern.fix_template);
                issue.fix_confidence = Some(pattern.confidence);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(issue = %issue.issue_type, error = %e, "Validation pattern lookup failed");
            }
        }
    }
    issues
}

pub fn validate_and_enrich(
    store: &PatternStore,
    files: &[GeneratedFile],
    limits: &ScoringLimits,
) -> Vec<ValidationIssue> {
    enrich(store, validate_artifacts(files, limits))
}

/// Input for recording whether a validation fix worked.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnValidationInput {
    pub issue_type: ValidationIssueKind,
    pub description: String,
    pub fix: String,
    pub success: bool,
}

pub fn learn_validation_pattern(
    store: &PatternStore,
    input: &LearnValidationInput,
) -> Result<crate::db::models::ValidationPattern, AppError> {
    if input.fix.trim().is_empty() {
        return Err(AppError::Validation("fix cannot be empty".into()));
    }
    store.learn_validation(input.issue_type, &input.description, &input.fix, input.success)
}
