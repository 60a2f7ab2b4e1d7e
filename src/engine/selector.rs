//! Strategy selection: classify a request and build its ordered fallback chain.

use crate::config::StrategyConfig;
use crate::db::models::{Approach, ProviderKind};

use super::types::{GenerationRequest, GenerationStrategy};

/// How demanding a request looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Complex,
}

/// Complex when the text runs past the token threshold or any context is
/// attached.
pub fn classify(request: &GenerationRequest, config: &StrategyConfig) -> Complexity {
    if request.token_count() > config.complex_token_threshold || request.has_context() {
        Complexity::Complex
    } else {
        Complexity::Simple
    }
}

/// Ordered, non-empty list of strategies, highest priority first.
///
/// Complex requests lead with the most capable provider; simple ones lead
/// with the fastest. Deterministic for a given request and config.
pub fn select_strategies(
    request: &GenerationRequest,
    config: &StrategyConfig,
) -> Vec<GenerationStrategy> {
    let plan: [(ProviderKind, Approach); 3] = match classify(request, config) {
        Complexity::Complex => [
            (ProviderKind::Flagship, Approach::Progressive),
            (ProviderKind::Standard, Approach::Progressive),
            (ProviderKind::Fast, Approach::Simple),
        ],
        Complexity::Simple => [
            (ProviderKind::Fast, Approach::Simple),
            (ProviderKind::Standard, Approach::Hybrid),
            (ProviderKind::Flagship, Approach::Progressive),
        ],
    };

    plan.iter()
        .enumerate()
        .map(|(i, (provider, approach))| GenerationStrategy {
            provider: *provider,
            approach: *approach,
            timeout_ms: timeout_for(*provider, config),
            priority: i as u32 + 1,
        })
        .collect()
}

fn timeout_for(provider: ProviderKind, config: &StrategyConfig) -> u64 {
    match provider {
        ProviderKind::Flagship => config.flagship_timeout_ms,
        ProviderKind::Standard => config.standard_timeout_ms,
        ProviderKind::Fast => config.fast_timeout_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[test]
    fn test_complex_request_prefers_flagship() {
        let req = GenerationRequest::new(words(80), None);
        let strategies = select_strategies(&req, &StrategyConfig::default());

        let providers: Vec<_> = strategies.iter().map(|s| s.provider).collect();
        assert_eq!(
            providers,
            vec![ProviderKind::Flagship, ProviderKind::Standard, ProviderKind::Fast]
        );
        assert_eq!(strategies[0].approach, Approach::Progressive);
        assert_eq!(strategies[0].timeout_ms, 60_000);
        assert_eq!(strategies[1].timeout_ms, 45_000);
        assert_eq!(strategies[2].approach, Approach::Simple);
        assert_eq!(strategies[2].timeout_ms, 30_000);
    }

    #[test]
    fn test_simple_request_prefers_fast() {
        let req = GenerationRequest::new("make a landing page", None);
        let strategies = select_strategies(&req, &StrategyConfig::default());

        assert_eq!(strategies[0].provider, ProviderKind::Fast);
        assert_eq!(strategies[1].approach, Approach::Hybrid);
        assert_eq!(strategies[2].provider, ProviderKind::Flagship);
    }

    #[test]
    fn test_context_forces_complex() {
        let req = GenerationRequest::new("tiny", Some(json!({"framework": "vue"})));
        assert_eq!(classify(&req, &StrategyConfig::default()), Complexity::Complex);
    }

    #[test]
    fn test_threshold_is_strict() {
        let cfg = StrategyConfig::default();
        assert_eq!(classify(&GenerationRequest::new(words(50), None), &cfg), Complexity::Simple);
        assert_eq!(classify(&GenerationRequest::new(words(51), None), &cfg), Complexity::Complex);
    }

    #[test]
    fn test_priorities_and_determinism() {
        let req = GenerationRequest::new(words(10), None);
        let a = select_strategies(&req, &StrategyConfig::default());
        let b = select_strategies(&req, &StrategyConfig::default());
        assert_eq!(a, b);
        assert_eq!(a.iter().map(|s| s.priority).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
