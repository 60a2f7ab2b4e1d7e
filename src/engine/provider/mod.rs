pub mod extract;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::models::{ErrorType, FixType};
use crate::error::AppError;

use super::types::{GeneratedOutput, GenerationRequest, GenerationStrategy};

pub use http::HttpProvider;

// =============================================================================
// Capabilities
// =============================================================================

/// Opaque code-generation backend. One call per strategy attempt; the caller
/// owns the timeout.
#[async_trait]
pub trait GenerationCapability: Send + Sync {
    async fn generate(
        &self,
        strategy: &GenerationStrategy,
        request: &GenerationRequest,
    ) -> Result<GeneratedOutput, AppError>;
}

/// Backend that proposes a fix for a failing unit of code.
#[async_trait]
pub trait FixGenerationCapability: Send + Sync {
    async fn propose_fix(&self, request: &FixRequest) -> Result<FixProposal, AppError>;
}

// =============================================================================
// Fix request / proposal
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRequest {
    pub error_id: String,
    pub error_type: ErrorType,
    pub message: String,
    pub stack_trace: Option<String>,
    pub context: Option<String>,
    pub original_code: String,
}

/// Typed shape the fix model must answer with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixProposal {
    #[serde(alias = "fixedCode")]
    pub fixed_code: String,
    #[serde(default)]
    pub explanation: String,
    pub confidence: f64,
    #[serde(default, alias = "fixType")]
    pub fix_type: Option<FixType>,
}

impl FixProposal {
    /// Reject proposals a caller cannot act on.
    pub fn validate(self) -> Result<Self, AppError> {
        if self.fixed_code.trim().is_empty() {
            return Err(AppError::ProviderResponse("fix proposal has empty fixed_code".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence) || self.confidence.is_nan() {
            return Err(AppError::ProviderResponse(format!(
                "fix confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_proposal_accepts_camel_case() {
        let p: FixProposal = serde_json::from_str(
            r#"{"fixedCode": "let x = 1;", "explanation": "init", "confidence": 0.9, "fixType": "code_patch"}"#,
        )
        .unwrap();
        assert_eq!(p.fix_type, Some(FixType::CodePatch));
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_fix_proposal_validation() {
        let empty = FixProposal {
            fixed_code: "  ".into(),
            explanation: String::new(),
            confidence: 0.5,
            fix_type: None,
        };
        assert!(matches!(empty.validate(), Err(AppError::ProviderResponse(_))));

        let out_of_range = FixProposal {
            fixed_code: "x".into(),
            explanation: String::new(),
            confidence: 1.5,
            fix_type: None,
        };
        assert!(out_of_range.validate().is_err());
    }
}
