//! Self-healing pipeline: detect → generate fix → apply → verify | roll back → learn.
//!
//! Every state change is a conditional update in the repository layer, so a
//! transition that is not allowed from the current status surfaces as
//! `AppError::InvalidTransition` instead of silently overwriting state.
//! Notifications and the audit trail are best effort.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Thresholds;
use crate::db::models::{
    AutoFix, CreateAutoFixInput, DetectedError, ErrorPattern, ErrorStatus, ErrorType, FixStatus,
    FixType, Severity,
};
use crate::db::repos::healing::errors::FixAttempt;
use crate::db::repos::healing::{audit, errors as error_repo, fixes as fix_repo};
use crate::db::repos::patterns::error_patterns;
use crate::db::DbPool;
use crate::error::AppError;
use crate::notifications::{self, Notifier};

use super::background::BackgroundTasks;
use super::detector::{self, ErrorReport};
use super::patterns::PatternStore;
use super::provider::{FixGenerationCapability, FixProposal, FixRequest};

/// Placeholder a learned solution template may use for the failing code.
pub const ORIGINAL_CODE_PLACEHOLDER: &str = "{{original_code}}";

crate::sql_text_enum! {
    /// How a fix is being applied. Auto is only accepted for fixes that
    /// cleared the auto-apply threshold when they were generated.
    pub enum ApplyMode {
        Auto => "auto",
        Manual => "manual",
    }
}

impl Default for ApplyMode {
    fn default() -> Self {
        ApplyMode::Manual
    }
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedFix {
    pub pattern_signature: String,
    pub solution_template: String,
    pub confidence: f64,
    /// The pattern was learned from this exact error signature.
    pub exact_match: bool,
}

impl SuggestedFix {
    fn from_pattern(pattern: ErrorPattern, signature: &str) -> Self {
        Self {
            exact_match: pattern.signature == signature,
            pattern_signature: pattern.signature,
            solution_template: pattern.solution_template,
            confidence: pattern.confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionOutcome {
    pub error: DetectedError,
    pub suggested_fix: Option<SuggestedFix>,
    /// A fix attempt was queued on the background task queue.
    pub background_healing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FixGeneration {
    /// The fix is `pending` and waits for an explicit apply.
    #[serde(rename_all = "camelCase")]
    Proposed { fix: AutoFix, reused_pattern: bool },
    /// The fix cleared the auto-apply threshold and was applied.
    #[serde(rename_all = "camelCase")]
    AutoApplied {
        fix: AutoFix,
        error: DetectedError,
        reused_pattern: bool,
    },
    /// The provider failed; the error is back in `detected`.
    #[serde(rename_all = "camelCase")]
    ProviderFailed { error_id: String, reason: String },
    /// The attempt cap was hit; the error is `failed` with auto-fix disabled.
    #[serde(rename_all = "camelCase")]
    AttemptsExhausted { error: DetectedError },
}

/// A fix and its owning error after a transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixTransition {
    pub fix: AutoFix,
    pub error: DetectedError,
}

// ============================================================================
// Commands
// ============================================================================

/// Every healing operation, as accepted on the `/healing` endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum HealingCommand {
    #[serde(rename_all = "camelCase")]
    DetectError {
        message: String,
        #[serde(default)]
        stack_trace: Option<String>,
        #[serde(default)]
        context: Option<serde_json::Value>,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    GenerateFix {
        error_id: String,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ApplyFix {
        fix_id: String,
        #[serde(default)]
        mode: ApplyMode,
    },
    #[serde(rename_all = "camelCase")]
    VerifyFix {
        fix_id: String,
        success: bool,
        #[serde(default)]
        test_results: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RollbackFix { fix_id: String, reason: String },
    #[serde(rename_all = "camelCase")]
    LearnPattern {
        error_type: ErrorType,
        pattern: String,
        solution: String,
        success: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "operation", content = "result", rename_all = "snake_case")]
pub enum HealingResponse {
    DetectError(DetectionOutcome),
    GenerateFix(FixGeneration),
    ApplyFix(FixTransition),
    VerifyFix(FixTransition),
    RollbackFix(FixTransition),
    LearnPattern(ErrorPattern),
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct HealingPipeline {
    pool: DbPool,
    patterns: Arc<PatternStore>,
    fixer: Arc<dyn FixGenerationCapability>,
    notifier: Arc<dyn Notifier>,
    tasks: Arc<BackgroundTasks>,
    thresholds: Thresholds,
}

impl HealingPipeline {
    pub fn new(
        pool: DbPool,
        patterns: Arc<PatternStore>,
        fixer: Arc<dyn FixGenerationCapability>,
        notifier: Arc<dyn Notifier>,
        tasks: Arc<BackgroundTasks>,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            pool,
            patterns,
            fixer,
            notifier,
            tasks,
            thresholds,
        }
    }

    pub async fn dispatch(self: &Arc<Self>, command: HealingCommand) -> Result<HealingResponse, AppError> {
        match command {
            HealingCommand::DetectError {
                message,
                stack_trace,
                context,
                code,
            } => {
                let report = ErrorReport {
                    message,
                    stack_trace,
                    context,
                    code,
                };
                self.detect_and_heal(&report).map(HealingResponse::DetectError)
            }
            HealingCommand::GenerateFix { error_id, code } => self
                .generate_fix(&error_id, code.as_deref())
                .await
                .map(HealingResponse::GenerateFix),
            HealingCommand::ApplyFix { fix_id, mode } => {
                self.apply_fix(&fix_id, mode).map(HealingResponse::ApplyFix)
            }
            HealingCommand::VerifyFix {
                fix_id,
                success,
                test_results,
            } => self
                .verify_fix(&fix_id, success, test_results.as_deref())
                .map(HealingResponse::VerifyFix),
            HealingCommand::RollbackFix { fix_id, reason } => {
                self.rollback_fix(&fix_id, &reason).map(HealingResponse::RollbackFix)
            }
            HealingCommand::LearnPattern {
                error_type,
                pattern,
                solution,
                success,
            } => self
                .learn_pattern(error_type, &pattern, &solution, success)
                .map(HealingResponse::LearnPattern),
        }
    }

    // ------------------------------------------------------------------
    // detect_error
    // ------------------------------------------------------------------

    /// Classify and persist an error, and surface the best learned fix
    /// without applying it.
    pub fn detect_error(&self, report: &ErrorReport) -> Result<DetectionOutcome, AppError> {
        let mut error = detector::record(&self.pool, report)?;

        if let Some(code) = report.code.as_deref().filter(|c| !c.trim().is_empty()) {
            error_repo::set_current_code(&self.pool, &error.id, code)?;
            error.current_code = Some(code.to_string());
        }

        if error.severity == Severity::Critical {
            notifications::notify_critical_error(self.notifier.as_ref(), &error.id, &error.message);
        }

        let suggested_fix = match self.patterns.suggest_fix(error.error_type, &error.signature) {
            Ok(found) => found.map(|p| SuggestedFix::from_pattern(p, &error.signature)),
            Err(e) => {
                tracing::warn!(error_id = %error.id, error = %e, "Pattern lookup failed");
                None
            }
        };

        self.audit(
            &error.id,
            None,
            "detected",
            Some(&format!("{} / {}", error.error_type, error.severity)),
        );

        Ok(DetectionOutcome {
            error,
            suggested_fix,
            background_healing: false,
        })
    }

    /// Detect, then queue a background fix attempt for severe errors that
    /// arrived with code.
    pub fn detect_and_heal(self: &Arc<Self>, report: &ErrorReport) -> Result<DetectionOutcome, AppError> {
        let mut outcome = self.detect_error(report)?;
        if outcome.error.severity >= Severity::High && outcome.error.current_code.is_some() {
            self.heal_in_background(&outcome.error.id);
            outcome.background_healing = true;
        }
        Ok(outcome)
    }

    /// Run generate_fix on the task queue.
    pub fn heal_in_background(self: &Arc<Self>, error_id: &str) {
        let this = Arc::clone(self);
        let error_id = error_id.to_string();
        self.tasks.spawn("background_heal", async move {
            this.generate_fix(&error_id, None).await?;
            Ok(())
        });
    }

    // ------------------------------------------------------------------
    // generate_fix
    // ------------------------------------------------------------------

    pub async fn generate_fix(&self, error_id: &str, code: Option<&str>) -> Result<FixGeneration, AppError> {
        let error = error_repo::get_by_id(&self.pool, error_id)?;

        match error.status {
            ErrorStatus::Fixed | ErrorStatus::FixedAuto => {
                return Err(AppError::InvalidTransition(format!(
                    "error {error_id} is {}; roll back its fix before generating another",
                    error.status
                )));
            }
            ErrorStatus::Failed => {
                return Err(AppError::InvalidTransition(format!(
                    "error {error_id} has failed and needs manual review"
                )));
            }
            _ if error.auto_fix_disabled => {
                return Err(AppError::InvalidTransition(format!(
                    "auto-fix is disabled for error {error_id}"
                )));
            }
            _ => {}
        }

        let original_code = match code.filter(|c| !c.trim().is_empty()) {
            Some(c) => c.to_string(),
            None => error.current_code.clone().ok_or_else(|| {
                AppError::Validation(format!("no code available to fix for error {error_id}"))
            })?,
        };

        if let Some(exhausted) = self.start_attempt(error_id)? {
            return Ok(exhausted);
        }

        let reusable = match self.patterns.reusable_fix(error.error_type, &error.signature) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error_id, error = %e, "Reusable pattern lookup failed");
                None
            }
        };

        let (input, reused_pattern) = match reusable {
            Some(pattern) => (
                CreateAutoFixInput {
                    error_id: error_id.to_string(),
                    fix_type: FixType::CodePatch,
                    fixed_code: pattern
                        .solution_template
                        .replace(ORIGINAL_CODE_PLACEHOLDER, &original_code),
                    original_code,
                    explanation: Some(format!(
                        "Reused learned pattern ({} successes, {} failures)",
                        pattern.success_count, pattern.failure_count
                    )),
                    confidence: pattern.confidence,
                    auto_apply_eligible: pattern.confidence >= self.thresholds.auto_apply_confidence,
                    pattern_signature: Some(pattern.signature),
                },
                true,
            ),
            None => {
                let request = FixRequest {
                    error_id: error_id.to_string(),
                    error_type: error.error_type,
                    message: error.message.clone(),
                    stack_trace: error.stack_trace.clone(),
                    context: error.context.clone(),
                    original_code: original_code.clone(),
                };
                let proposal = match self.fixer.propose_fix(&request).await.and_then(FixProposal::validate) {
                    Ok(p) => p,
                    Err(e) => return self.provider_failed(error_id, e),
                };
                (
                    CreateAutoFixInput {
                        error_id: error_id.to_string(),
                        fix_type: proposal.fix_type.unwrap_or(FixType::AiGenerated),
                        original_code,
                        fixed_code: proposal.fixed_code,
                        explanation: Some(proposal.explanation).filter(|e| !e.is_empty()),
                        confidence: proposal.confidence,
                        auto_apply_eligible: proposal.confidence >= self.thresholds.auto_apply_confidence,
                        pattern_signature: None,
                    },
                    false,
                )
            }
        };

        let fix = fix_repo::create(&self.pool, input)?;

        self.audit(
            error_id,
            Some(&fix.id),
            "fix_generated",
            Some(&format!(
                "confidence {:.2}{}",
                fix.confidence,
                if reused_pattern { ", reused pattern" } else { "" }
            )),
        );

        tracing::info!(
            error_id,
            fix_id = %fix.id,
            confidence = fix.confidence,
            reused_pattern,
            "Fix generated"
        );

        if !fix.auto_apply_eligible {
            notifications::notify_manual_review(
                self.notifier.as_ref(),
                error_id,
                Some(&fix.id),
                &format!(
                    "Fix confidence {:.2} is below the auto-apply threshold {:.2}",
                    fix.confidence, self.thresholds.auto_apply_confidence
                ),
            );
            return Ok(FixGeneration::Proposed { fix, reused_pattern });
        }

        match self.apply_fix(&fix.id, ApplyMode::Auto) {
            Ok(FixTransition { fix, error }) => Ok(FixGeneration::AutoApplied {
                fix,
                error,
                reused_pattern,
            }),
            Err(AppError::InvalidTransition(reason)) => {
                tracing::warn!(error_id, fix_id = %fix.id, %reason, "Auto-apply refused, fix left pending");
                let fix = fix_repo::get_by_id(&self.pool, &fix.id)?;
                Ok(FixGeneration::Proposed { fix, reused_pattern })
            }
            Err(e) => Err(e),
        }
    }

    /// Consume one attempt. `Some` carries the exhaustion outcome; a
    /// resolved or disabled error is an `InvalidTransition`.
    fn start_attempt(&self, error_id: &str) -> Result<Option<FixGeneration>, AppError> {
        let max = self.thresholds.max_fix_attempts;
        match error_repo::begin_fix_attempt(&self.pool, error_id, max)? {
            FixAttempt::Started => Ok(None),
            FixAttempt::NotFixable => {
                let error = error_repo::get_by_id(&self.pool, error_id)?;
                Err(AppError::InvalidTransition(format!(
                    "error {error_id} is {} and cannot take another fix attempt",
                    error.status
                )))
            }
            FixAttempt::Exhausted => {
                if !error_repo::mark_exhausted(&self.pool, error_id, max)? {
                    let error = error_repo::get_by_id(&self.pool, error_id)?;
                    return Err(AppError::InvalidTransition(format!(
                        "error {error_id} moved to {} while its attempts ran out",
                        error.status
                    )));
                }
                let reason = format!("auto-fix gave up after {max} attempts");
                self.audit(error_id, None, "attempts_exhausted", Some(&reason));
                notifications::notify_manual_review(self.notifier.as_ref(), error_id, None, &reason);
                tracing::warn!(error_id, "Fix attempts exhausted, auto-fix disabled");
                let error = error_repo::get_by_id(&self.pool, error_id)?;
                Ok(Some(FixGeneration::AttemptsExhausted { error }))
            }
        }
    }


    fn provider_failed(&self, error_id: &str, cause: AppError) -> Result<FixGeneration, AppError> {
        let reason = cause.to_string();
        tracing::warn!(error_id, error = %reason, "Fix provider failed");
        if !error_repo::release_attempt(&self.pool, error_id)? {
            tracing::debug!(error_id, "Error left analyzing before the provider failed");
        }
        self.audit(error_id, None, "provider_failed", Some(&reason));
        notifications::notify_healing_issue(
            self.notifier.as_ref(),
            error_id,
            None,
            &format!("Fix generation failed: {reason}"),
        );
        Ok(FixGeneration::ProviderFailed {
            error_id: error_id.to_string(),
            reason,
        })
    }

    // ------------------------------------------------------------------
    // apply / verify / rollback
    // ------------------------------------------------------------------

    pub fn apply_fix(&self, fix_id: &str, mode: ApplyMode) -> Result<FixTransition, AppError> {
        let pending = fix_repo::get_by_id(&self.pool, fix_id)?;

        let error_status = match mode {
            ApplyMode::Manual => ErrorStatus::Fixed,
            ApplyMode::Auto => {
                if !pending.auto_apply_eligible {
                    return Err(AppError::InvalidTransition(format!(
                        "fix {fix_id} has confidence {:.2}, below the auto-apply threshold; apply it manually",
                        pending.confidence
                    )));
                }
                let error = error_repo::get_by_id(&self.pool, &pending.error_id)?;
                if error.auto_fix_disabled {
                    return Err(AppError::InvalidTransition(format!(
                        "auto-fix is disabled for error {}",
                        error.id
                    )));
                }
                ErrorStatus::FixedAuto
            }
        };

        let fix = fix_repo::mark_applied(&self.pool, fix_id, error_status)?;
        let error = error_repo::get_by_id(&self.pool, &fix.error_id)?;
        self.audit(&error.id, Some(fix_id), "fix_applied", Some(mode.as_str()));
        tracing::info!(fix_id, error_id = %error.id, mode = %mode, "Fix applied");

        Ok(FixTransition { fix, error })
    }

    pub fn verify_fix(
        &self,
        fix_id: &str,
        success: bool,
        test_results: Option<&str>,
    ) -> Result<FixTransition, AppError> {
        let fix = fix_repo::record_verification(&self.pool, fix_id, success, test_results)?;
        let error = error_repo::get_by_id(&self.pool, &fix.error_id)?;

        self.learn_from_fix(&error, &fix, success);
        self.audit(
            &error.id,
            Some(fix_id),
            if success { "fix_verified" } else { "verification_failed" },
            test_results,
        );
        if !success {
            notifications::notify_healing_issue(
                self.notifier.as_ref(),
                &error.id,
                Some(fix_id),
                "Applied fix failed verification",
            );
        }

        Ok(FixTransition { fix, error })
    }

    pub fn rollback_fix(&self, fix_id: &str, reason: &str) -> Result<FixTransition, AppError> {
        let before = fix_repo::get_by_id(&self.pool, fix_id)?;
        // A failed verification has already been learned as a failure.
        let already_learned = before.status == FixStatus::Failed;

        let fix = fix_repo::mark_rolled_back(&self.pool, fix_id, reason)?;
        let error = error_repo::get_by_id(&self.pool, &fix.error_id)?;

        if !already_learned {
            self.learn_from_fix(&error, &fix, false);
        }
        self.audit(&error.id, Some(fix_id), "fix_rolled_back", Some(reason));
        notifications::notify_healing_issue(
            self.notifier.as_ref(),
            &error.id,
            Some(fix_id),
            &format!("Fix rolled back: {reason}"),
        );
        tracing::info!(fix_id, error_id = %error.id, "Fix rolled back");

        Ok(FixTransition { fix, error })
    }

    // ------------------------------------------------------------------
    // learn_pattern
    // ------------------------------------------------------------------

    pub fn learn_pattern(
        &self,
        error_type: ErrorType,
        pattern: &str,
        solution: &str,
        success: bool,
    ) -> Result<ErrorPattern, AppError> {
        if pattern.trim().is_empty() {
            return Err(AppError::Validation("pattern cannot be empty".into()));
        }
        if solution.trim().is_empty() {
            return Err(AppError::Validation("solution cannot be empty".into()));
        }
        self.patterns.learn(error_type, pattern, solution, success)
    }

    /// Feed a fix outcome back into the pattern store. Fixes built from a
    /// learned pattern reinforce that pattern; provider fixes teach the
    /// error's own signature.
    fn learn_from_fix(&self, error: &DetectedError, fix: &AutoFix, success: bool) {
        let source = match fix.pattern_signature.as_deref() {
            Some(signature) => match error_patterns::get(&self.pool, signature) {
                Ok(Some(p)) => Some((p.signature, p.description, p.solution_template)),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(fix_id = %fix.id, error = %e, "Could not load source pattern");
                    None
                }
            },
            None => None,
        };
        let (signature, description, solution) = source.unwrap_or_else(|| {
            (
                error.signature.clone(),
                error.message.clone(),
                fix.fixed_code.clone(),
            )
        });

        if let Err(e) =
            self.patterns
                .learn_signature(error.error_type, &signature, &description, &solution, success)
        {
            tracing::warn!(fix_id = %fix.id, error = %e, "Pattern learning failed");
        }
    }

    fn audit(&self, error_id: &str, fix_id: Option<&str>, event: &str, detail: Option<&str>) {
        if let Err(e) = audit::record(&self.pool, error_id, fix_id, event, detail) {
            tracing::warn!(error_id, event, error = %e, "Audit write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::db::init_test_db;
    use crate::notifications::testing::RecordingNotifier;
    use crate::notifications::NotificationKind;

    #[derive(Default)]
    struct ScriptedFixer {
        answers: Mutex<VecDeque<Result<FixProposal, AppError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFixer {
        fn answering(answers: Vec<Result<FixProposal, AppError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FixGenerationCapability for ScriptedFixer {
        async fn propose_fix(&self, _request: &FixRequest) -> Result<FixProposal, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::Provider("no scripted answer".into())))
        }
    }

    fn proposal(code: &str, confidence: f64) -> Result<FixProposal, AppError> {
        Ok(FixProposal {
            fixed_code: code.into(),
            explanation: "guard against undefined".into(),
            confidence,
            fix_type: None,
        })
    }

    struct Harness {
        pipeline: Arc<HealingPipeline>,
        fixer: Arc<ScriptedFixer>,
        notifier: Arc<RecordingNotifier>,
        tasks: Arc<BackgroundTasks>,
        pool: DbPool,
    }

    fn harness(fixer: ScriptedFixer) -> Harness {
        harness_with(fixer, Thresholds::default())
    }

    fn harness_with(fixer: ScriptedFixer, thresholds: Thresholds) -> Harness {
        let pool = init_test_db().unwrap();
        let fixer = Arc::new(fixer);
        let notifier = Arc::new(RecordingNotifier::default());
        let (tasks, _rx) = BackgroundTasks::new();
        let patterns = Arc::new(PatternStore::new(pool.clone(), thresholds));
        let pipeline = Arc::new(HealingPipeline::new(
            pool.clone(),
            patterns,
            fixer.clone(),
            notifier.clone(),
            tasks.clone(),
            thresholds,
        ));
        Harness {
            pipeline,
            fixer,
            notifier,
            tasks,
            pool,
        }
    }

    const TYPE_ERROR: &str = "TypeError: Cannot read properties of undefined (reading 'map')";
    const CODE: &str = "items.map(render)";

    fn report(message: &str, code: Option<&str>) -> ErrorReport {
        ErrorReport {
            message: message.into(),
            code: code.map(str::to_string),
            ..Default::default()
        }
    }

    fn proposed(outcome: FixGeneration) -> (AutoFix, bool) {
        match outcome {
            FixGeneration::Proposed { fix, reused_pattern } => (fix, reused_pattern),
            other => panic!("expected a proposed fix, got {other:?}"),
        }
    }

    fn auto_applied(outcome: FixGeneration) -> FixTransition {
        match outcome {
            FixGeneration::AutoApplied { fix, error, .. } => FixTransition { fix, error },
            other => panic!("expected an auto-applied fix, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_type_error_auto_heals_and_learns() {
        let h = harness(ScriptedFixer::answering(vec![proposal("(items ?? []).map(render)", 0.9)]));

        let detected = h.pipeline.detect_error(&report(TYPE_ERROR, Some(CODE))).unwrap();
        assert_eq!(detected.error.error_type, ErrorType::TypeError);
        assert_eq!(detected.error.severity, Severity::High);
        assert!(detected.suggested_fix.is_none());
        let error_id = detected.error.id.clone();

        let outcome = h.pipeline.generate_fix(&error_id, None).await.unwrap();
        assert!(matches!(outcome, FixGeneration::AutoApplied { reused_pattern: false, .. }));
        let applied = auto_applied(outcome);
        let fix = applied.fix.clone();
        assert!(fix.auto_apply_eligible);
        assert_eq!(fix.original_code, CODE);
        assert_eq!(applied.fix.status, FixStatus::Applied);
        assert_eq!(applied.error.status, ErrorStatus::FixedAuto);
        assert_eq!(applied.error.current_code.as_deref(), Some("(items ?? []).map(render)"));

        let verified = h.pipeline.verify_fix(&fix.id, true, Some("12 passed")).unwrap();
        assert_eq!(verified.fix.status, FixStatus::Verified);
        assert_eq!(verified.error.status, ErrorStatus::FixedAuto);

        let learned = error_patterns::get(&h.pool, &detected.error.signature).unwrap().unwrap();
        assert_eq!(learned.success_count, 1);
        assert!((learned.confidence - 0.6).abs() < 1e-9);
        assert!(!h.notifier.kinds().contains(&NotificationKind::ManualReview));

        let events: Vec<String> = audit::list_for_error(&h.pool, &error_id)
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events, vec!["detected", "fix_generated", "fix_applied", "fix_verified"]);
    }

    #[tokio::test]
    async fn test_confident_pattern_is_reused_without_provider() {
        let h = harness(ScriptedFixer::default());
        for _ in 0..10 {
            h.pipeline
                .learn_pattern(ErrorType::TypeError, TYPE_ERROR, "guard({{original_code}})", true)
                .unwrap();
        }

        let detected = h.pipeline.detect_error(&report(TYPE_ERROR, Some(CODE))).unwrap();
        let suggestion = detected.suggested_fix.unwrap();
        assert!(suggestion.exact_match);
        assert!(suggestion.confidence >= 0.85);

        let outcome = h.pipeline.generate_fix(&detected.error.id, None).await.unwrap();
        let FixGeneration::AutoApplied { fix, error, reused_pattern } = outcome else {
            panic!("expected the reused pattern to be auto-applied");
        };
        assert!(reused_pattern);
        assert_eq!(fix.fix_type, FixType::CodePatch);
        assert_eq!(fix.fixed_code, "guard(items.map(render))");
        assert_eq!(error.status, ErrorStatus::FixedAuto);
        assert_eq!(h.fixer.calls.load(Ordering::SeqCst), 0);

        h.pipeline.verify_fix(&fix.id, true, None).unwrap();
        let pattern = error_patterns::get(&h.pool, &detected.error.signature).unwrap().unwrap();
        assert_eq!(pattern.success_count, 11);
        assert_eq!(pattern.solution_template, "guard({{original_code}})");
    }

    #[tokio::test]
    async fn test_low_confidence_fix_requires_manual_apply() {
        let h = harness(ScriptedFixer::answering(vec![proposal("fixed()", 0.6)]));
        let detected = h.pipeline.detect_error(&report(TYPE_ERROR, Some(CODE))).unwrap();

        let (fix, _) = proposed(h.pipeline.generate_fix(&detected.error.id, None).await.unwrap());
        assert!(!fix.auto_apply_eligible);
        assert_eq!(fix.status, FixStatus::Pending);
        assert_eq!(
            error_repo::get_by_id(&h.pool, &detected.error.id).unwrap().status,
            ErrorStatus::Fixing
        );
        assert!(h.notifier.kinds().contains(&NotificationKind::ManualReview));

        let err = h.pipeline.apply_fix(&fix.id, ApplyMode::Auto).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        let applied = h.pipeline.apply_fix(&fix.id, ApplyMode::Manual).unwrap();
        assert_eq!(applied.error.status, ErrorStatus::Fixed);
    }

    #[tokio::test]
    async fn test_fourth_attempt_fails_error_and_disables_auto_fix() {
        let h = harness(ScriptedFixer::default());
        let detected = h.pipeline.detect_error(&report(TYPE_ERROR, Some(CODE))).unwrap();
        let error_id = detected.error.id;

        for _ in 0..3 {
            let outcome = h.pipeline.generate_fix(&error_id, None).await.unwrap();
            assert!(matches!(outcome, FixGeneration::ProviderFailed { .. }));
        }
        assert_eq!(h.fixer.calls.load(Ordering::SeqCst), 3);

        let outcome = h.pipeline.generate_fix(&error_id, None).await.unwrap();
        let FixGeneration::AttemptsExhausted { error } = outcome else {
            panic!("expected exhaustion");
        };
        assert_eq!(error.status, ErrorStatus::Failed);
        assert!(error.auto_fix_disabled);
        assert_eq!(error.fix_attempt_count, 3);
        assert_eq!(h.fixer.calls.load(Ordering::SeqCst), 3);
        assert!(h.notifier.kinds().contains(&NotificationKind::ManualReview));

        let again = h.pipeline.generate_fix(&error_id, None).await.unwrap_err();
        assert!(matches!(again, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_provider_failure_returns_error_to_detected() {
        let h = harness(ScriptedFixer::answering(vec![Err(AppError::Timeout("fix model".into()))]));
        let detected = h.pipeline.detect_error(&report(TYPE_ERROR, Some(CODE))).unwrap();

        let outcome = h.pipeline.generate_fix(&detected.error.id, None).await.unwrap();
        let FixGeneration::ProviderFailed { reason, .. } = outcome else {
            panic!("expected provider failure");
        };
        assert!(reason.contains("fix model"));

        let error = error_repo::get_by_id(&h.pool, &detected.error.id).unwrap();
        assert_eq!(error.status, ErrorStatus::Detected);
        assert_eq!(error.fix_attempt_count, 1);
        assert!(h.notifier.kinds().contains(&NotificationKind::HealingIssue));
        assert!(fix_repo::list_for_error(&h.pool, &error.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_restores_code_and_learns_failure() {
        let h = harness(ScriptedFixer::answering(vec![
            proposal("patched()", 0.6),
            proposal("patched_again()", 0.9),
        ]));
        let detected = h.pipeline.detect_error(&report(TYPE_ERROR, Some(CODE))).unwrap();
        let error_id = detected.error.id.clone();

        let (fix, _) = proposed(h.pipeline.generate_fix(&error_id, None).await.unwrap());
        h.pipeline.apply_fix(&fix.id, ApplyMode::Manual).unwrap();

        let rolled = h.pipeline.rollback_fix(&fix.id, "broke checkout").unwrap();
        assert_eq!(rolled.fix.status, FixStatus::RolledBack);
        assert_eq!(rolled.fix.rollback_reason.as_deref(), Some("broke checkout"));
        assert_eq!(rolled.error.status, ErrorStatus::Detected);
        assert_eq!(rolled.error.current_code.as_deref(), Some(CODE));
        assert!(rolled.error.resolved_at.is_none());

        let pattern = error_patterns::get(&h.pool, &detected.error.signature).unwrap().unwrap();
        assert_eq!((pattern.success_count, pattern.failure_count), (0, 1));

        // The error is fixable again from the restored code.
        let second = auto_applied(h.pipeline.generate_fix(&error_id, None).await.unwrap());
        assert_eq!(second.fix.original_code, CODE);
        assert_eq!(second.error.current_code.as_deref(), Some("patched_again()"));
    }

    #[tokio::test]
    async fn test_rollback_after_failed_verification_learns_once() {
        let h = harness(ScriptedFixer::answering(vec![proposal("patched()", 0.9)]));
        let detected = h.pipeline.detect_error(&report(TYPE_ERROR, Some(CODE))).unwrap();

        let fix = auto_applied(h.pipeline.generate_fix(&detected.error.id, None).await.unwrap()).fix;
        let verified = h.pipeline.verify_fix(&fix.id, false, Some("3 failed")).unwrap();
        assert_eq!(verified.fix.status, FixStatus::Failed);

        h.pipeline.rollback_fix(&fix.id, "tests failing").unwrap();
        let pattern = error_patterns::get(&h.pool, &detected.error.signature).unwrap().unwrap();
        assert_eq!(pattern.failure_count, 1);
    }

    #[tokio::test]
    async fn test_generate_fix_rejects_fixed_error_and_missing_code() {
        let h = harness(ScriptedFixer::answering(vec![proposal("patched()", 0.9)]));

        let no_code = h.pipeline.detect_error(&report(TYPE_ERROR, None)).unwrap();
        let err = h.pipeline.generate_fix(&no_code.error.id, None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(
            error_repo::get_by_id(&h.pool, &no_code.error.id).unwrap().fix_attempt_count,
            0
        );

        auto_applied(h.pipeline.generate_fix(&no_code.error.id, Some(CODE)).await.unwrap());
        let err = h.pipeline.generate_fix(&no_code.error.id, None).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_critical_error_notifies() {
        let h = harness(ScriptedFixer::default());
        let detected = h.pipeline.detect_error(&report("FATAL: renderer crash", None)).unwrap();
        assert_eq!(detected.error.severity, Severity::Critical);
        assert_eq!(h.notifier.kinds(), vec![NotificationKind::CriticalError]);
    }

    #[tokio::test]
    async fn test_dispatch_detect_queues_background_heal() {
        let h = harness(ScriptedFixer::answering(vec![proposal("patched()", 0.95)]));
        let command: HealingCommand = serde_json::from_value(serde_json::json!({
            "operation": "detect_error",
            "message": TYPE_ERROR,
            "code": CODE,
        }))
        .unwrap();

        let response = h.pipeline.dispatch(command).await.unwrap();
        let HealingResponse::DetectError(outcome) = &response else {
            panic!("wrong response variant");
        };
        assert!(outcome.background_healing);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["operation"], "detect_error");
        assert_eq!(json["result"]["error"]["status"], "detected");

        h.tasks.wait_idle().await;
        let error = error_repo::get_by_id(&h.pool, &outcome.error.id).unwrap();
        assert_eq!(error.status, ErrorStatus::FixedAuto);
        assert_eq!(error.current_code.as_deref(), Some("patched()"));
    }

    #[tokio::test]
    async fn test_dispatch_apply_defaults_to_manual() {
        let h = harness(ScriptedFixer::answering(vec![proposal("patched()", 0.6)]));
        let detected = h.pipeline.detect_error(&report(TYPE_ERROR, Some(CODE))).unwrap();
        let (fix, _) = proposed(h.pipeline.generate_fix(&detected.error.id, None).await.unwrap());

        let command: HealingCommand = serde_json::from_value(serde_json::json!({
            "operation": "apply_fix",
            "fixId": fix.id,
        }))
        .unwrap();
        let HealingResponse::ApplyFix(t) = h.pipeline.dispatch(command).await.unwrap() else {
            panic!("wrong response variant");
        };
        assert_eq!(t.error.status, ErrorStatus::Fixed);
    }

    #[tokio::test]
    async fn test_dispatch_generate_fix_applies_by_confidence() {
        let h = harness(ScriptedFixer::answering(vec![
            proposal("patched()", 0.9),
            proposal("maybe_patched()", 0.6),
        ]));
        // Medium severity and no code at detection: no background healing.
        let confident = h.pipeline.detect_error(&report("warning: x is undefined", None)).unwrap();
        let unsure = h.pipeline.detect_error(&report("warning: y is undefined", None)).unwrap();
        assert_eq!(confident.error.severity, Severity::Medium);

        let generate = |error_id: &str| -> HealingCommand {
            serde_json::from_value(serde_json::json!({
                "operation": "generate_fix",
                "errorId": error_id,
                "code": CODE,
            }))
            .unwrap()
        };

        let response = h.pipeline.dispatch(generate(&confident.error.id)).await.unwrap();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["result"]["outcome"], "auto_applied");
        assert_eq!(json["result"]["fix"]["status"], "applied");
        assert_eq!(json["result"]["error"]["status"], "fixed_auto");
        let error = error_repo::get_by_id(&h.pool, &confident.error.id).unwrap();
        assert_eq!(error.status, ErrorStatus::FixedAuto);
        assert_eq!(error.current_code.as_deref(), Some("patched()"));

        let HealingResponse::GenerateFix(outcome) =
            h.pipeline.dispatch(generate(&unsure.error.id)).await.unwrap()
        else {
            panic!("wrong response variant");
        };
        let (fix, _) = proposed(outcome);
        assert_eq!(fix.status, FixStatus::Pending);
        assert_eq!(
            error_repo::get_by_id(&h.pool, &unsure.error.id).unwrap().status,
            ErrorStatus::Fixing
        );
    }

    /// Applies an older pending fix while its own proposal is being produced.
    struct InterleavingFixer {
        pool: DbPool,
        older_fix: Mutex<Option<String>>,
        interleaved: Mutex<Option<Result<AutoFix, AppError>>>,
    }

    #[async_trait]
    impl FixGenerationCapability for InterleavingFixer {
        async fn propose_fix(&self, _request: &FixRequest) -> Result<FixProposal, AppError> {
            let older = self.older_fix.lock().unwrap().take();
            if let Some(id) = older {
                let applied = fix_repo::mark_applied(&self.pool, &id, ErrorStatus::Fixed);
                *self.interleaved.lock().unwrap() = Some(applied);
            }
            proposal("second()", 0.6)
        }
    }

    #[tokio::test]
    async fn test_older_fix_cannot_be_applied_during_a_new_attempt() {
        let pool = init_test_db().unwrap();
        let (tasks, _rx) = BackgroundTasks::new();
        let fixer = Arc::new(InterleavingFixer {
            pool: pool.clone(),
            older_fix: Mutex::new(None),
            interleaved: Mutex::new(None),
        });
        let pipeline = HealingPipeline::new(
            pool.clone(),
            Arc::new(PatternStore::new(pool.clone(), Thresholds::default())),
            fixer.clone(),
            Arc::new(RecordingNotifier::default()),
            tasks,
            Thresholds::default(),
        );

        let detected = pipeline.detect_error(&report(TYPE_ERROR, Some(CODE))).unwrap();
        let error_id = detected.error.id;
        let (first, _) = proposed(pipeline.generate_fix(&error_id, None).await.unwrap());

        *fixer.older_fix.lock().unwrap() = Some(first.id.clone());
        let (second, _) = proposed(pipeline.generate_fix(&error_id, None).await.unwrap());

        let interleaved = fixer.interleaved.lock().unwrap().take().unwrap();
        assert!(matches!(interleaved, Err(AppError::InvalidTransition(_))));
        assert_eq!(fix_repo::get_by_id(&pool, &first.id).unwrap().status, FixStatus::Failed);
        assert!(pipeline.apply_fix(&first.id, ApplyMode::Manual).is_err());

        pipeline.apply_fix(&second.id, ApplyMode::Manual).unwrap();
        let statuses: Vec<FixStatus> = fix_repo::list_for_error(&pool, &error_id)
            .unwrap()
            .into_iter()
            .map(|f| f.status)
            .collect();
        assert_eq!(statuses, vec![FixStatus::Applied, FixStatus::Failed]);

        let rolled = pipeline.rollback_fix(&second.id, "regression").unwrap();
        assert_eq!(rolled.error.current_code.as_deref(), Some(CODE));
    }

    #[tokio::test]
    async fn test_attempt_on_resolved_error_is_not_exhaustion() {
        let thresholds = Thresholds {
            max_fix_attempts: 1,
            ..Thresholds::default()
        };
        let h = harness_with(ScriptedFixer::answering(vec![proposal("patched()", 0.6)]), thresholds);
        let detected = h.pipeline.detect_error(&report(TYPE_ERROR, Some(CODE))).unwrap();
        let error_id = detected.error.id;

        let (fix, _) = proposed(h.pipeline.generate_fix(&error_id, None).await.unwrap());
        h.pipeline.apply_fix(&fix.id, ApplyMode::Manual).unwrap();

        // The budget is spent, but the error is already healed.
        let err = h.pipeline.start_attempt(&error_id).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        let error = error_repo::get_by_id(&h.pool, &error_id).unwrap();
        assert_eq!(error.status, ErrorStatus::Fixed);
        assert!(!error.auto_fix_disabled);
        assert_eq!(error.fix_attempt_count, 1);
        // Only the low-confidence review request, no exhaustion notice.
        let reviews = h
            .notifier
            .kinds()
            .into_iter()
            .filter(|k| *k == NotificationKind::ManualReview)
            .count();
        assert_eq!(reviews, 1);
    }

    #[test]
    fn test_unknown_operation_is_rejected() {
        let parsed: Result<HealingCommand, _> =
            serde_json::from_value(serde_json::json!({ "operation": "drop_tables" }));
        assert!(parsed.is_err());
    }
}
