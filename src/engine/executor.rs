//! Strategy execution: sequential fallback or a bounded two-way race.
//!
//! Every attempt is time-boxed and never raises: timeouts, provider errors,
//! open circuits and empty outputs all become failed results. Only when no
//! attempt succeeded does the executor return an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ScoringLimits, StrategyConfig, Thresholds};
use crate::db::models::{CreateTelemetryInput, ExecutionMode};
use crate::db::repos::generation::telemetry as telemetry_repo;
use crate::db::DbPool;
use crate::error::AppError;

use super::background::BackgroundTasks;
use super::failover::ProviderCircuitBreaker;
use super::patterns::PatternStore;
use super::provider::GenerationCapability;
use super::types::{AlternateScore, GenerationOutcome, GenerationRequest, GenerationResult, GenerationStrategy};
use super::{quality, selector, validation};

/// Most strategies ever run at once in parallel mode.
pub const MAX_PARALLEL: usize = 2;

pub struct GenerationExecutor {
    pool: DbPool,
    generator: Arc<dyn GenerationCapability>,
    breaker: Arc<ProviderCircuitBreaker>,
    patterns: Arc<PatternStore>,
    tasks: Arc<BackgroundTasks>,
    thresholds: Thresholds,
    scoring: ScoringLimits,
    strategies: StrategyConfig,
}

impl GenerationExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: DbPool,
        generator: Arc<dyn GenerationCapability>,
        breaker: Arc<ProviderCircuitBreaker>,
        patterns: Arc<PatternStore>,
        tasks: Arc<BackgroundTasks>,
        thresholds: Thresholds,
        scoring: ScoringLimits,
        strategies: StrategyConfig,
    ) -> Self {
        Self {
            pool,
            generator,
            breaker,
            patterns,
            tasks,
            thresholds,
            scoring,
            strategies,
        }
    }

    pub fn breaker(&self) -> &ProviderCircuitBreaker {
        &self.breaker
    }

    /// Select strategies for the request and run them in the given mode.
    pub async fn execute(
        &self,
        request: &GenerationRequest,
        mode: ExecutionMode,
    ) -> Result<GenerationOutcome, AppError> {
        if request.text.trim().is_empty() {
            return Err(AppError::Validation("request text cannot be empty".into()));
        }

        let strategies = selector::select_strategies(request, &self.strategies);
        tracing::info!(
            request_id = %request.id,
            mode = %mode,
            strategies = strategies.len(),
            "Executing generation request"
        );

        let results = match mode {
            ExecutionMode::Sequential => self.run_sequential(&strategies, request).await,
            ExecutionMode::Parallel => self.run_parallel(&strategies, request).await,
        };

        let winner_idx = select_best(&results);
        self.record_telemetry(request, mode, &results, winner_idx);

        let Some(winner_idx) = winner_idx else {
            let reasons: Vec<String> = results
                .iter()
                .map(|r| {
                    format!(
                        "{}: {}",
                        r.strategy.provider,
                        r.error_message.as_deref().unwrap_or("failed")
                    )
                })
                .collect();
            tracing::warn!(request_id = %request.id, attempts = results.len(), "All strategies failed");
            return Err(AppError::AllStrategiesFailed(reasons.join("; ")));
        };

        let attempts = results.len();
        let mut results = results;
        let winner = results.remove(winner_idx);
        let alternates = results.iter().map(AlternateScore::from).collect();
        let validation_issues =
            validation::validate_and_enrich(&self.patterns, &winner.files, &self.scoring);

        tracing::info!(
            request_id = %request.id,
            provider = %winner.strategy.provider,
            score = winner.quality_score,
            attempts,
            "Generation winner selected"
        );

        Ok(GenerationOutcome {
            request_id: request.id.clone(),
            mode,
            winner,
            alternates,
            attempts,
            validation_issues,
        })
    }

    /// Try strategies in priority order, stopping at the first good-enough result.
    pub async fn run_sequential(
        &self,
        strategies: &[GenerationStrategy],
        request: &GenerationRequest,
    ) -> Vec<GenerationResult> {
        let mut results = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let result = self.run_one(strategy, request).await;
            let good_enough =
                result.succeeded && result.quality_score >= self.thresholds.good_enough_score;
            results.push(result);
            if good_enough {
                break;
            }
        }
        results
    }

    /// Run the top two strategies concurrently and wait for both.
    pub async fn run_parallel(
        &self,
        strategies: &[GenerationStrategy],
        request: &GenerationRequest,
    ) -> Vec<GenerationResult> {
        match strategies {
            [] => Vec::new(),
            [only] => vec![self.run_one(only, request).await],
            [first, second, ..] => {
                let (a, b) = tokio::join!(self.run_one(first, request), self.run_one(second, request));
                vec![a, b]
            }
        }
    }

    async fn run_one(
        &self,
        strategy: &GenerationStrategy,
        request: &GenerationRequest,
    ) -> GenerationResult {
        let provider = strategy.provider;
        if !self.breaker.is_available(provider) {
            tracing::debug!(provider = %provider, "Circuit open, skipping strategy");
            return GenerationResult::failed(*strategy, 0, format!("circuit open for provider {provider}"));
        }

        let started = Instant::now();
        let timeout = Duration::from_millis(strategy.timeout_ms);
        let outcome = tokio::time::timeout(timeout, self.generator.generate(strategy, request)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Err(_) => GenerationResult::failed(
                *strategy,
                duration_ms,
                format!("timed out after {} ms", strategy.timeout_ms),
            ),
            Ok(Err(e)) => GenerationResult::failed(*strategy, duration_ms, e.to_string()),
            Ok(Ok(output)) if output.files.is_empty() => {
                GenerationResult::failed(*strategy, duration_ms, "provider returned no files")
            }
            Ok(Ok(output)) => GenerationResult {
                succeeded: true,
                quality_score: quality::score(&output.files, &self.scoring),
                files: output.files,
                strategy: *strategy,
                duration_ms,
                error_message: None,
            },
        };

        if result.succeeded {
            self.breaker.record_success(provider);
        } else {
            self.breaker.record_failure(provider);
        }

        tracing::debug!(
            provider = %provider,
            approach = %strategy.approach,
            succeeded = result.succeeded,
            score = result.quality_score,
            duration_ms,
            "Strategy attempt finished"
        );
        result
    }

    /// Persist every attempt off the request path.
    fn record_telemetry(
        &self,
        request: &GenerationRequest,
        mode: ExecutionMode,
        results: &[GenerationResult],
        winner: Option<usize>,
    ) {
        let inputs: Vec<CreateTelemetryInput> = results
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let is_winner = winner == Some(i);
                CreateTelemetryInput {
                    request_id: request.id.clone(),
                    provider: r.strategy.provider,
                    approach: r.strategy.approach,
                    timeout_ms: r.strategy.timeout_ms,
                    priority: r.strategy.priority,
                    mode,
                    succeeded: r.succeeded,
                    quality_score: r.quality_score,
                    duration_ms: r.duration_ms,
                    error_message: r.error_message.clone(),
                    file_count: r.files.len(),
                    is_winner,
                    files_json: if is_winner {
                        serde_json::to_string(&r.files).ok()
                    } else {
                        None
                    },
                }
            })
            .collect();

        let pool = self.pool.clone();
        self.tasks.spawn_blocking("record_generation_telemetry", move || {
            for input in inputs {
                telemetry_repo::record(&pool, input)?;
            }
            Ok(())
        });
    }
}

/// Index of the highest-scoring successful result; ties go to the earlier
/// (higher priority) attempt.
pub fn select_best(results: &[GenerationResult]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, r) in results.iter().enumerate() {
        if !r.succeeded {
            continue;
        }
        match best {
            Some(b) if results[b].quality_score >= r.quality_score => {}
            _ => best = Some(i),
        }
    }
    best
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::db::models::ProviderKind;
    use crate::engine::types::{GeneratedFile, GeneratedOutput};

    use super::*;

    /// Scripted behaviour for one provider.
    #[derive(Clone)]
    pub enum Script {
        Files(Vec<GeneratedFile>),
        Fail(&'static str),
        Empty,
        Sleep(Duration),
    }

    /// Generation backend answering from a per-provider script, tracking
    /// call counts and peak concurrency.
    #[derive(Default)]
    pub struct ScriptedGenerator {
        pub scripts: Mutex<HashMap<ProviderKind, Script>>,
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub peak: AtomicUsize,
        pub delay: Duration,
    }

    impl ScriptedGenerator {
        pub fn with(scripts: &[(ProviderKind, Script)]) -> Self {
            Self {
                scripts: Mutex::new(scripts.iter().cloned().collect()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl GenerationCapability for ScriptedGenerator {
        async fn generate(
            &self,
            strategy: &GenerationStrategy,
            _request: &GenerationRequest,
        ) -> Result<GeneratedOutput, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let script = self.scripts.lock().unwrap().get(&strategy.provider).cloned();
            let out = match script {
                Some(Script::Files(files)) => Ok(GeneratedOutput {
                    files,
                    metadata: serde_json::Value::Null,
                }),
                Some(Script::Fail(msg)) => Err(AppError::Provider(msg.into())),
                Some(Script::Empty) => Ok(GeneratedOutput::default()),
                Some(Script::Sleep(d)) => {
                    tokio::time::sleep(d).await;
                    Ok(GeneratedOutput::default())
                }
                None => Err(AppError::Provider("unscripted".into())),
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    /// 100-point project.
    pub fn good_files() -> Vec<GeneratedFile> {
        let body = "import { render } from 'react-dom';\nrender(App());\n".repeat(2);
        vec![
            GeneratedFile::new("index.js", body.clone()),
            GeneratedFile::new("package.json", "{\"name\": \"demo\", \"private\": true, \"version\": \"0.1.0\"}"),
            GeneratedFile::new("vite.config.js", body),
        ]
    }

    /// 40-point output: a lone small note.
    pub fn mediocre_files() -> Vec<GeneratedFile> {
        vec![GeneratedFile::new("notes.md", "todo")]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::*;
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::ProviderKind;

    fn executor(generator: Arc<ScriptedGenerator>, pool: DbPool) -> (GenerationExecutor, Arc<BackgroundTasks>) {
        let (tasks, _rx) = BackgroundTasks::new();
        let patterns = Arc::new(PatternStore::new(pool.clone(), Thresholds::default()));
        let exec = GenerationExecutor::new(
            pool,
            generator,
            Arc::new(ProviderCircuitBreaker::new()),
            patterns,
            tasks.clone(),
            Thresholds::default(),
            ScoringLimits::default(),
            StrategyConfig::default(),
        );
        (exec, tasks)
    }

    fn simple_request() -> GenerationRequest {
        GenerationRequest::new("make a counter page", None)
    }

    fn result(score: i32, succeeded: bool) -> GenerationResult {
        let strategy = GenerationStrategy {
            provider: ProviderKind::Fast,
            approach: crate::db::models::Approach::Simple,
            timeout_ms: 1000,
            priority: 1,
        };
        GenerationResult {
            succeeded,
            files: Vec::new(),
            quality_score: score,
            strategy,
            duration_ms: 1,
            error_message: None,
        }
    }

    #[test]
    fn test_select_best() {
        assert_eq!(select_best(&[]), None);
        assert_eq!(select_best(&[result(90, false)]), None);
        assert_eq!(select_best(&[result(55, true), result(82, true)]), Some(1));
        assert_eq!(select_best(&[result(70, true), result(70, true)]), Some(0));
        assert_eq!(select_best(&[result(99, false), result(40, true)]), Some(1));
    }

    #[tokio::test]
    async fn test_sequential_stops_at_first_good_enough() {
        let pool = init_test_db().unwrap();
        let gen = Arc::new(ScriptedGenerator::with(&[
            (ProviderKind::Fast, Script::Files(mediocre_files())),
            (ProviderKind::Standard, Script::Files(good_files())),
            (ProviderKind::Flagship, Script::Files(good_files())),
        ]));
        let (exec, tasks) = executor(gen.clone(), pool.clone());

        let req = simple_request();
        let outcome = exec.execute(&req, ExecutionMode::Sequential).await.unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.winner.strategy.provider, ProviderKind::Standard);
        assert!(outcome.winner.quality_score >= 70);
        assert_eq!(outcome.alternates.len(), 1);
        assert!(outcome.alternates[0].quality_score < 70);

        tasks.wait_idle().await;
        let rows = telemetry_repo::list_for_request(&pool, &req.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|r| r.is_winner).count(), 1);
        assert!(rows.iter().find(|r| r.is_winner).unwrap().files_json.is_some());
        assert!(rows.iter().find(|r| !r.is_winner).unwrap().files_json.is_none());
    }

    #[tokio::test]
    async fn test_sequential_returns_best_when_none_good_enough() {
        let pool = init_test_db().unwrap();
        let gen = Arc::new(ScriptedGenerator::with(&[
            (ProviderKind::Fast, Script::Files(mediocre_files())),
            (ProviderKind::Standard, Script::Fail("rate limited")),
            (ProviderKind::Flagship, Script::Empty),
        ]));
        let (exec, _tasks) = executor(gen.clone(), pool);

        let outcome = exec.execute(&simple_request(), ExecutionMode::Sequential).await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.winner.strategy.provider, ProviderKind::Fast);

        let empty = outcome
            .alternates
            .iter()
            .find(|a| a.provider == ProviderKind::Flagship)
            .unwrap();
        assert!(!empty.succeeded);
        assert_eq!(empty.error_message.as_deref(), Some("provider returned no files"));
    }

    #[tokio::test]
    async fn test_all_failed_is_error() {
        let pool = init_test_db().unwrap();
        let gen = Arc::new(ScriptedGenerator::with(&[]));
        let (exec, _tasks) = executor(gen, pool);

        let err = exec.execute(&simple_request(), ExecutionMode::Sequential).await.unwrap_err();
        assert!(matches!(err, AppError::AllStrategiesFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_failed_result() {
        let pool = init_test_db().unwrap();
        let gen = Arc::new(ScriptedGenerator::with(&[
            (ProviderKind::Fast, Script::Sleep(Duration::from_secs(120))),
            (ProviderKind::Standard, Script::Files(good_files())),
        ]));
        let (exec, _tasks) = executor(gen, pool);

        let outcome = exec.execute(&simple_request(), ExecutionMode::Sequential).await.unwrap();
        assert_eq!(outcome.winner.strategy.provider, ProviderKind::Standard);
        assert_eq!(
            outcome.alternates[0].error_message.as_deref(),
            Some("timed out after 30000 ms")
        );
    }

    #[tokio::test]
    async fn test_parallel_runs_exactly_two() {
        let pool = init_test_db().unwrap();
        let mut gen = ScriptedGenerator::with(&[
            (ProviderKind::Fast, Script::Files(mediocre_files())),
            (ProviderKind::Standard, Script::Files(good_files())),
            (ProviderKind::Flagship, Script::Files(good_files())),
        ]);
        gen.delay = Duration::from_millis(20);
        let gen = Arc::new(gen);
        let (exec, _tasks) = executor(gen.clone(), pool);

        let outcome = exec.execute(&simple_request(), ExecutionMode::Parallel).await.unwrap();
        assert_eq!(outcome.attempts, MAX_PARALLEL);
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);
        assert!(gen.peak.load(Ordering::SeqCst) <= MAX_PARALLEL);
        assert_eq!(outcome.winner.strategy.provider, ProviderKind::Standard);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_provider_but_counts_attempt() {
        let pool = init_test_db().unwrap();
        let gen = Arc::new(ScriptedGenerator::with(&[
            (ProviderKind::Fast, Script::Files(good_files())),
            (ProviderKind::Standard, Script::Files(good_files())),
        ]));
        let (exec, _tasks) = executor(gen.clone(), pool);
        for _ in 0..5 {
            exec.breaker().record_failure(ProviderKind::Fast);
        }

        let outcome = exec.execute(&simple_request(), ExecutionMode::Sequential).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(gen.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.winner.strategy.provider, ProviderKind::Standard);
    }

    #[tokio::test]
    async fn test_empty_request_rejected() {
        let pool = init_test_db().unwrap();
        let (exec, _tasks) = executor(Arc::new(ScriptedGenerator::default()), pool);
        let err = exec
            .execute(&GenerationRequest::new("   ", None), ExecutionMode::Sequential)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
