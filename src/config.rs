//! Runtime configuration.
//!
//! Layering: built-in defaults → optional TOML file → environment overrides.
//! `.env` is loaded first via `dotenvy` so local development can keep
//! provider keys out of the shell profile.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

const CONFIG_FILE_NAME: &str = "buildloop.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding the database, logs and crash reports.
    pub data_dir: Option<PathBuf>,
    pub server: ServerConfig,
    pub thresholds: Thresholds,
    pub scoring: ScoringLimits,
    pub strategies: StrategyConfig,
    pub provider: ProviderConfig,
    pub schema_monitor: SchemaMonitorConfig,
    pub notifications: NotificationConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9430".into(),
        }
    }
}

/// Decision thresholds for generation and healing.
///
/// The defaults are inherited values without a documented derivation; they are
/// kept configurable rather than re-derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Quality score at which the sequential fallback loop stops early.
    pub good_enough_score: i32,
    /// Minimum pattern confidence to surface as a suggested fix.
    pub suggest_confidence: f64,
    /// Minimum confidence for reusing a pattern and for auto-applying a fix.
    pub auto_apply_confidence: f64,
    /// Maximum fix attempts per detected error.
    pub max_fix_attempts: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            good_enough_score: 70,
            suggest_confidence: 0.7,
            auto_apply_confidence: 0.85,
            max_fix_attempts: 3,
        }
    }
}

/// Mean-file-size bounds used by the quality scorer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringLimits {
    pub min_mean_file_bytes: usize,
    pub max_mean_file_bytes: usize,
}

impl Default for ScoringLimits {
    fn default() -> Self {
        Self {
            min_mean_file_bytes: 50,
            max_mean_file_bytes: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub flagship_timeout_ms: u64,
    pub standard_timeout_ms: u64,
    pub fast_timeout_ms: u64,
    /// Token count above which a request is treated as complex.
    pub complex_token_threshold: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            flagship_timeout_ms: 60_000,
            standard_timeout_ms: 45_000,
            fast_timeout_ms: 30_000,
            complex_token_threshold: 50,
        }
    }
}

/// OpenAI-compatible chat completions endpoint used for generation and fixes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub flagship_model: String,
    pub standard_model: String,
    pub fast_model: String,
    pub fix_model: String,
    pub fix_timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            flagship_model: "claude-opus-4".into(),
            standard_model: "claude-sonnet-4".into(),
            fast_model: "claude-haiku-4-5".into(),
            fix_model: "claude-sonnet-4".into(),
            fix_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaMonitorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// SQLite database whose schema is watched. Monitoring is off when unset.
    pub target_db: Option<PathBuf>,
}

impl Default for SchemaMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            target_db: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub telemetry_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { telemetry_days: 30 }
    }
}

impl AppConfig {
    /// Load configuration from `.env`, the TOML file, and the environment.
    ///
    /// The TOML file is `$BUILDLOOP_CONFIG` when set, otherwise
    /// `<data_dir>/buildloop.toml` if it exists.
    pub fn load() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let explicit = std::env::var("BUILDLOOP_CONFIG").ok().map(PathBuf::from);
        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => {
                let candidate = default_data_dir().join(CONFIG_FILE_NAME);
                if candidate.exists() {
                    Self::from_file(&candidate)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, AppError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `BUILDLOOP_*` overrides. The lookup is injected so tests never
    /// touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("BUILDLOOP_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(bind) = lookup("BUILDLOOP_BIND") {
            self.server.bind = bind;
        }
        if let Some(url) = lookup("BUILDLOOP_PROVIDER_URL") {
            self.provider.base_url = Some(url);
        }
        if let Some(key) = lookup("BUILDLOOP_PROVIDER_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = lookup("BUILDLOOP_NOTIFY_WEBHOOK") {
            self.notifications.webhook_url = Some(url);
        }
        if let Some(db) = lookup("BUILDLOOP_SCHEMA_DB") {
            self.schema_monitor.target_db = Some(PathBuf::from(db));
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let t = &self.thresholds;
        if !(0..=100).contains(&t.good_enough_score) {
            return Err(AppError::Config(format!(
                "thresholds.good_enough_score must be within 0..=100, got {}",
                t.good_enough_score
            )));
        }
        for (name, value) in [
            ("suggest_confidence", t.suggest_confidence),
            ("auto_apply_confidence", t.auto_apply_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AppError::Config(format!(
                    "thresholds.{name} must be within 0.0..=1.0, got {value}"
                )));
            }
        }
        if t.max_fix_attempts == 0 {
            return Err(AppError::Config("thresholds.max_fix_attempts must be at least 1".into()));
        }
        if self.scoring.min_mean_file_bytes >= self.scoring.max_mean_file_bytes {
            return Err(AppError::Config(
                "scoring.min_mean_file_bytes must be below scoring.max_mean_file_bytes".into(),
            ));
        }
        if self.schema_monitor.interval_secs == 0 {
            return Err(AppError::Config("schema_monitor.interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("buildloop")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let config = AppConfig::default();
        assert_eq!(config.thresholds.good_enough_score, 70);
        assert_eq!(config.thresholds.suggest_confidence, 0.7);
        assert_eq!(config.thresholds.auto_apply_confidence, 0.85);
        assert_eq!(config.thresholds.max_fix_attempts, 3);
        assert_eq!(config.schema_monitor.interval_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [thresholds]
            good_enough_score = 80

            [schema_monitor]
            interval_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.thresholds.good_enough_score, 80);
        assert_eq!(config.thresholds.max_fix_attempts, 3);
        assert_eq!(config.schema_monitor.interval_secs, 60);
        assert!(config.schema_monitor.enabled);
        assert_eq!(config.server.bind, "127.0.0.1:9430");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = AppConfig::from_toml_str("[thresholds\n").unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BUILDLOOP_BIND", "0.0.0.0:8080"),
            ("BUILDLOOP_PROVIDER_URL", "http://localhost:4000"),
            ("BUILDLOOP_SCHEMA_DB", "/tmp/app.db"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.provider.base_url.as_deref(), Some("http://localhost:4000"));
        assert_eq!(config.schema_monitor.target_db, Some(PathBuf::from("/tmp/app.db")));
        assert!(config.notifications.webhook_url.is_none());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = AppConfig::default();
        config.thresholds.auto_apply_confidence = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.thresholds.max_fix_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.scoring.min_mean_file_bytes = 100_000;
        assert!(config.validate().is_err());
    }
}
