//! Per-provider circuit breaker.
//!
//! After N consecutive failures a provider is "open" (skipped) for a cooldown
//! period, then half-opens and is allowed one probe.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::db::models::ProviderKind;

/// Consecutive failures before a provider circuit opens.
const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;

/// How long an open circuit stays open before allowing a probe request.
const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
struct CircuitState {
    consecutive_failures: u32,
    /// None = closed.
    opened_at: Option<Instant>,
}

/// Snapshot of one provider's circuit, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub provider: ProviderKind,
    pub consecutive_failures: u32,
    pub open: bool,
}

pub struct ProviderCircuitBreaker {
    states: Mutex<HashMap<ProviderKind, CircuitState>>,
    threshold: u32,
    cooldown: Duration,
}

impl ProviderCircuitBreaker {
    pub fn new() -> Self {
        Self::with_limits(CIRCUIT_BREAKER_THRESHOLD, CIRCUIT_COOLDOWN)
    }

    pub fn with_limits(threshold: u32, cooldown: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProviderKind, CircuitState>> {
        // Circuit state is plain counters; a poisoned lock is still usable.
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Circuit closed, or cooldown elapsed (half-open probe).
    pub fn is_available(&self, kind: ProviderKind) -> bool {
        let mut states = self.lock();
        let state = states.entry(kind).or_default();
        match state.opened_at {
            None => true,
            Some(opened) => {
                if opened.elapsed() >= self.cooldown {
                    tracing::info!(
                        provider = %kind,
                        "Circuit breaker half-open: allowing probe after cooldown",
                    );
                    state.opened_at = None;
                    state.consecutive_failures = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, kind: ProviderKind) {
        let mut states = self.lock();
        let state = states.entry(kind).or_default();
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn record_failure(&self, kind: ProviderKind) {
        let mut states = self.lock();
        let state = states.entry(kind).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold && state.opened_at.is_none() {
            tracing::warn!(
                provider = %kind,
                failures = state.consecutive_failures,
                "Circuit breaker opened after consecutive failures",
            );
            state.opened_at = Some(Instant::now());
        }
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let states = self.lock();
        let mut out: Vec<CircuitSnapshot> = ProviderKind::ALL
            .iter()
            .map(|kind| {
                let state = states.get(kind).cloned().unwrap_or_default();
                CircuitSnapshot {
                    provider: *kind,
                    consecutive_failures: state.consecutive_failures,
                    open: state.opened_at.is_some(),
                }
            })
            .collect();
        out.sort_by_key(|s| s.provider);
        out
    }
}

impl Default for ProviderCircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
