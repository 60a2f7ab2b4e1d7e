//! Deterministic quality heuristic for generated file sets.
//!
//! Scores are additive signals clamped to 0–100. The scorer never looks at
//! the request, only at the files, so the same files always score the same.

use serde::Serialize;

use crate::config::ScoringLimits;

use super::types::GeneratedFile;

const BASELINE: i32 = 30;
const ENTRY_POINT: i32 = 20;
const MANIFEST: i32 = 10;
const EXTRA_CONFIG: i32 = 10;
const SIZE_FLOOR: i32 = 10;
const SIZE_CEILING: i32 = 10;
const MODULE_REFS: i32 = 10;

const MANIFEST_NAMES: &[&str] = &[
    "package.json",
    "cargo.toml",
    "pyproject.toml",
    "requirements.txt",
    "go.mod",
    "composer.json",
    "gemfile",
];

/// Stems that mark a runnable entry point, matched against the lower-cased
/// file name before its extension.
const ENTRY_STEMS: &[&str] = &["index", "main", "app", "server", "lib"];

const CONFIG_NAMES: &[&str] = &[
    "tsconfig.json",
    "jsconfig.json",
    ".env.example",
    "dockerfile",
    ".eslintrc",
    ".eslintrc.json",
    ".prettierrc",
    "makefile",
];

const CONFIG_EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "ini"];

const MODULE_MARKERS: &[&str] = &["import ", "require(", "use ", "from ", "<script src=", "#include"];

/// Score with the individual signals that contributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub score: i32,
    pub signals: Vec<&'static str>,
}

pub fn score(files: &[GeneratedFile], limits: &ScoringLimits) -> i32 {
    evaluate(files, limits).score
}

pub fn evaluate(files: &[GeneratedFile], limits: &ScoringLimits) -> QualityReport {
    if files.is_empty() {
        return QualityReport {
            score: 0,
            signals: Vec::new(),
        };
    }

    let mut score = BASELINE;
    let mut signals = vec!["baseline"];

    if files.iter().any(|f| is_entry_point(&f.path)) {
        score += ENTRY_POINT;
        signals.push("entry_point");
    }

    if files.iter().any(|f| is_manifest(&f.path)) {
        score += MANIFEST;
        signals.push("manifest");
    }

    if files.iter().any(|f| is_config(&f.path)) {
        score += EXTRA_CONFIG;
        signals.push("config");
    }

    let total: usize = files.iter().map(|f| f.content.len()).sum();
    let mean = total / files.len();
    if mean > limits.min_mean_file_bytes {
        score += SIZE_FLOOR;
        signals.push("size_floor");
    }
    if mean < limits.max_mean_file_bytes {
        score += SIZE_CEILING;
        signals.push("size_ceiling");
    }

    if files
        .iter()
        .any(|f| MODULE_MARKERS.iter().any(|m| f.content.contains(m)))
    {
        score += MODULE_REFS;
        signals.push("module_refs");
    }

    QualityReport {
        score: score.clamp(0, 100),
        signals,
    }
}

pub(crate) fn file_name(path: &str) -> String {
    path.rsplit(&['/', '\\'][..])
        .next()
        .unwrap_or(path)
        .to_ascii_lowercase()
}

pub(crate) fn is_manifest(path: &str) -> bool {
    MANIFEST_NAMES.contains(&file_name(path).as_str())
}

pub(crate) fn is_entry_point(path: &str) -> bool {
    let name = file_name(path);
    match name.split_once('.') {
        Some((stem, ext)) => !ext.is_empty() && ENTRY_STEMS.contains(&stem),
        None => false,
    }
}

fn is_config(path: &str) -> bool {
    if is_manifest(path) {
        return false;
    }
    let name = file_name(path);
    if CONFIG_NAMES.contains(&name.as_str()) {
        return true;
    }
    if name.contains(".config.") {
        return true;
    }
    name.rsplit_once('.')
        .map(|(_, ext)| CONFIG_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}
