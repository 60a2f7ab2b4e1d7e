//! Learned fix patterns with Laplace-smoothed confidence.
//!
//! Confidence is `(s + 2) / (s + f + 4)`: it starts at 0.5, stays strictly
//! inside (0, 1), rises on every success and falls on every failure.
//! Persistence and the atomic counter update live in the pattern repos; this
//! layer adds lookup policy, a per-category candidate cache, and the reaction
//! to schema change signals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;

use crate::config::Thresholds;
use crate::db::models::{ErrorPattern, ErrorType, ValidationIssueKind, ValidationPattern};
use crate::db::repos::patterns::{error_patterns as error_repo, validation_patterns as validation_repo};
use crate::db::DbPool;
use crate::error::AppError;

use super::detector::{error_signature, normalize_description, pattern_signature};
use super::schema_monitor::SchemaSignal;

/// Candidates kept per category.
const CANDIDATE_LIMIT: i64 = 20;

pub fn laplace_confidence(successes: i64, failures: i64) -> f64 {
    (successes as f64 + 2.0) / (successes as f64 + failures as f64 + 4.0)
}

/// Pick the best pattern from `candidates`: an exact signature match wins,
/// otherwise the highest confidence (candidates arrive best-first).
pub fn pick_best<'a>(candidates: &'a [ErrorPattern], signature: &str) -> Option<&'a ErrorPattern> {
    candidates
        .iter()
        .find(|p| p.signature == signature)
        .or_else(|| candidates.first())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternStoreStats {
    pub cached_categories: usize,
    pub cache_invalidations: u64,
    pub decays: u64,
}

/// Candidate lists per category. `generation` moves on every invalidation
/// so a fill computed before it can be recognised as stale.
#[derive(Default)]
struct CandidateCache {
    entries: HashMap<ErrorType, Vec<ErrorPattern>>,
    generation: u64,
}

impl CandidateCache {
    fn invalidate(&mut self, category: Option<ErrorType>) {
        match category {
            Some(c) => {
                self.entries.remove(&c);
            }
            None => self.entries.clear(),
        }
        self.generation += 1;
    }
}

pub struct PatternStore {
    pool: DbPool,
    thresholds: Thresholds,
    cache: Mutex<CandidateCache>,
    cache_invalidations: AtomicU64,
    decays: AtomicU64,
}

impl PatternStore {
    pub fn new(pool: DbPool, thresholds: Thresholds) -> Self {
        Self {
            pool,
            thresholds,
            cache: Mutex::new(CandidateCache::default()),
            cache_invalidations: AtomicU64::new(0),
            decays: AtomicU64::new(0),
        }
    }

    fn cache(&self) -> MutexGuard<'_, CandidateCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Suggestable candidates for a category (confidence ≥ suggest threshold).
    fn candidates(&self, category: ErrorType) -> Result<Vec<ErrorPattern>, AppError> {
        let seen = {
            let cache = self.cache();
            if let Some(hit) = cache.entries.get(&category) {
                return Ok(hit.clone());
            }
            cache.generation
        };
        let fresh = error_repo::candidates(
            &self.pool,
            category,
            self.thresholds.suggest_confidence,
            CANDIDATE_LIMIT,
        )?;
        self.fill(category, seen, fresh.clone());
        Ok(fresh)
    }

    /// Cache `fresh` unless an invalidation happened since `seen` was read.
    fn fill(&self, category: ErrorType, seen: u64, fresh: Vec<ErrorPattern>) -> bool {
        let mut cache = self.cache();
        if cache.generation != seen {
            return false;
        }
        cache.entries.insert(category, fresh);
        true
    }

    /// Best pattern to surface as a suggestion, never applied automatically.
    pub fn suggest_fix(
        &self,
        category: ErrorType,
        signature: &str,
    ) -> Result<Option<ErrorPattern>, AppError> {
        let candidates = self.candidates(category)?;
        Ok(pick_best(&candidates, signature).cloned())
    }

    /// Best pattern confident enough to reuse without calling a provider.
    pub fn reusable_fix(
        &self,
        category: ErrorType,
        signature: &str,
    ) -> Result<Option<ErrorPattern>, AppError> {
        let min = self.thresholds.auto_apply_confidence;
        let candidates: Vec<ErrorPattern> = self
            .candidates(category)?
            .into_iter()
            .filter(|p| p.confidence >= min)
            .collect();
        Ok(pick_best(&candidates, signature).cloned())
    }

    /// Record one outcome for an error pattern. `pattern` is the error
    /// description the signature is derived from.
    pub fn learn(
        &self,
        category: ErrorType,
        pattern: &str,
        solution: &str,
        success: bool,
    ) -> Result<ErrorPattern, AppError> {
        let signature = error_signature(category, pattern);
        self.learn_signature(category, &signature, pattern, solution, success)
    }

    /// Record one outcome against an already-computed signature.
    pub fn learn_signature(
        &self,
        category: ErrorType,
        signature: &str,
        description: &str,
        solution: &str,
        success: bool,
    ) -> Result<ErrorPattern, AppError> {
        let learned = error_repo::learn(
            &self.pool,
            signature,
            category,
            &normalize_description(description),
            solution,
            success,
        )?;
        self.cache().invalidate(Some(category));

        tracing::debug!(
            signature = %learned.signature,
            success,
            confidence = learned.confidence,
            "Pattern learned"
        );
        Ok(learned)
    }

    pub fn list_error_patterns(&self, limit: i64) -> Result<Vec<ErrorPattern>, AppError> {
        error_repo::list_all(&self.pool, limit)
    }

    // ------------------------------------------------------------------
    // Validation patterns
    // ------------------------------------------------------------------

    pub fn learn_validation(
        &self,
        issue_type: ValidationIssueKind,
        description: &str,
        fix: &str,
        success: bool,
    ) -> Result<ValidationPattern, AppError> {
        let signature = pattern_signature(issue_type.as_str(), description);
        validation_repo::learn(
            &self.pool,
            &signature,
            issue_type,
            &normalize_description(description),
            fix,
            success,
        )
    }

    pub fn suggest_validation_fix(
        &self,
        issue_type: ValidationIssueKind,
        signature: &str,
    ) -> Result<Option<ValidationPattern>, AppError> {
        let candidates = validation_repo::candidates(
            &self.pool,
            issue_type,
            self.thresholds.suggest_confidence,
            CANDIDATE_LIMIT,
        )?;
        let exact = candidates.iter().position(|p| p.signature == signature);
        Ok(match exact {
            Some(i) => candidates.into_iter().nth(i),
            None => candidates.into_iter().next(),
        })
    }

    pub fn list_validation_patterns(&self, limit: i64) -> Result<Vec<ValidationPattern>, AppError> {
        validation_repo::list_all(&self.pool, limit)
    }

    // ------------------------------------------------------------------
    // Schema signals
    // ------------------------------------------------------------------

    pub fn clear_cache(&self) {
        self.cache().invalidate(None);
        self.cache_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Cache invalidation clears candidates; a pattern update halves all
    /// evidence so stale patterns drift back toward the prior.
    pub fn apply_schema_signal(&self, signal: &SchemaSignal) -> Result<(), AppError> {
        if signal.requires_pattern_update {
            let errors = error_repo::decay_all(&self.pool)?;
            let validations = validation_repo::decay_all(&self.pool)?;
            self.decays.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                version = signal.version_number,
                error_patterns = errors,
                validation_patterns = validations,
                "Decayed pattern evidence after schema change"
            );
        }
        if signal.requires_cache_invalidation || signal.requires_pattern_update {
            self.clear_cache();
        }
        Ok(())
    }

    /// Consume schema signals until the sender is dropped.
    pub fn spawn_signal_listener(
        self: &Arc<Self>,
        mut rx: watch::Receiver<Option<SchemaSignal>>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let signal = rx.borrow_and_update().clone();
                if let Some(signal) = signal {
                    if let Err(e) = store.apply_schema_signal(&signal) {
                        tracing::warn!(error = %e, "Failed to apply schema signal to patterns");
                    }
                }
            }
            tracing::debug!("Schema signal channel closed");
        })
    }

    pub fn stats(&self) -> PatternStoreStats {
        PatternStoreStats {
            cached_categories: self.cache().entries.len(),
            cache_invalidations: self.cache_invalidations.load(Ordering::Relaxed),
            decays: self.decays.load(Ordering::Relaxed),
        }
    }
}
