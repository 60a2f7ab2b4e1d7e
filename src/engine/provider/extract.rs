//! JSON extraction from free-form model output.
//!
//! Models wrap their answer in prose. We look for a fenced ```json block
//! first, then for the first bare JSON object carrying a discriminating key,
//! and finally deserialize into the caller's typed schema.

use serde::de::DeserializeOwned;

use crate::error::AppError;

/// Extract and deserialize the first JSON object with any of `keys` into `T`.
/// Missing JSON and schema mismatches are both `ProviderResponse` errors.
pub fn parse_typed<T: DeserializeOwned>(output: &str, keys: &[&str]) -> Result<T, AppError> {
    let value = extract_json_by_key(output, keys).ok_or_else(|| {
        AppError::ProviderResponse(format!(
            "no JSON object with any of [{}] in model output",
            keys.join(", ")
        ))
    })?;
    serde_json::from_value(value)
        .map_err(|e| AppError::ProviderResponse(format!("model output did not match schema: {e}")))
}

pub fn extract_json_by_key(output: &str, keys: &[&str]) -> Option<serde_json::Value> {
    if let Some(val) = extract_fenced_json(output) {
        if keys.iter().any(|k| val.get(*k).is_some()) {
            return Some(val);
        }
    }
    extract_bare_json_with_key(output, keys)
}

/// Last parseable ```json fenced object in the output.
fn extract_fenced_json(output: &str) -> Option<serde_json::Value> {
    let mut in_block = false;
    let mut json_content = String::new();
    let mut best_result: Option<serde_json::Value> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if !in_block && trimmed.eq_ignore_ascii_case("```json") {
            in_block = true;
            json_content.clear();
            continue;
        }
        if in_block && trimmed == "```" {
            in_block = false;
            if let Ok(val) = serde_json::from_str::<serde_json::Value>(&json_content) {
                if val.is_object() {
                    best_result = Some(val);
                }
            }
            continue;
        }
        if in_block {
            json_content.push_str(line);
            json_content.push('\n');
        }
    }

    best_result
}

fn extract_bare_json_with_key(output: &str, keys: &[&str]) -> Option<serde_json::Value> {
    let chars: Vec<char> = output.chars().collect();

    for start in 0..chars.len() {
        if chars[start] != '{' {
            continue;
        }
        if let Some(end) = find_matching_brace(&chars, start) {
            let candidate: String = chars[start..=end].iter().collect();
            if let Ok(val) = serde_json::from_str::<serde_json::Value>(&candidate) {
                if keys.iter().any(|k| val.get(*k).is_some()) {
                    return Some(val);
                }
            }
        }
    }

    None
}

fn find_matching_brace(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in chars.iter().enumerate().skip(start) {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if ch == '{' {
            depth += 1;
        } else if ch == '}' {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }

    None
}
