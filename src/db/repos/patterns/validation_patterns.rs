use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::{ValidationIssueKind, ValidationPattern};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_pattern(row: &Row) -> rusqlite::Result<ValidationPattern> {
    Ok(ValidationPattern {
        signature: row.get("signature")?,
        issue_type: row.get("issue_type")?,
        description: row.get("description")?,
        fix_template: row.get("fix_template")?,
        success_count: row.get("success_count")?,
        failure_count: row.get("failure_count")?,
        confidence: row.get("confidence")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Same upsert and confidence rule as error patterns, keyed on the
/// validation issue signature.
pub fn learn(
    pool: &DbPool,
    signature: &str,
    issue_type: ValidationIssueKind,
    description: &str,
    fix_template: &str,
    success: bool,
) -> Result<ValidationPattern, AppError> {
    if signature.trim().is_empty() {
        return Err(AppError::Validation("Pattern signature cannot be empty".into()));
    }

    let now = chrono::Utc::now().to_rfc3339();
    let (s, f): (i64, i64) = if success { (1, 0) } else { (0, 1) };

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO validation_patterns
         (signature, issue_type, description, fix_template,
          success_count, failure_count, confidence, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, (?5 + 2.0) / (?5 + ?6 + 4.0), ?7, ?7)
         ON CONFLICT(signature) DO UPDATE SET
            success_count = success_count + ?5,
            failure_count = failure_count + ?6,
            confidence = (success_count + ?5 + 2.0) / (success_count + failure_count + ?5 + ?6 + 4.0),
            fix_template = CASE WHEN ?5 > 0 THEN ?4 ELSE fix_template END,
            description = CASE WHEN ?5 > 0 THEN ?3 ELSE description END,
            updated_at = ?7",
        params![signature, issue_type, description, fix_template, s, f, now],
    )?;
    drop(conn);

    get(pool, signature)?
        .ok_or_else(|| AppError::NotFound(format!("ValidationPattern {signature}")))
}

pub fn get(pool: &DbPool, signature: &str) -> Result<Option<ValidationPattern>, AppError> {
    let conn = pool.get()?;
    let pattern = conn
        .query_row(
            "SELECT * FROM validation_patterns WHERE signature = ?1",
            params![signature],
            row_to_pattern,
        )
        .optional()?;
    Ok(pattern)
}

pub fn candidates(
    pool: &DbPool,
    issue_type: ValidationIssueKind,
    min_confidence: f64,
    limit: i64,
) -> Result<Vec<ValidationPattern>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM validation_patterns
         WHERE issue_type = ?1 AND confidence >= ?2
         ORDER BY confidence DESC, success_count DESC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![issue_type, min_confidence, limit], row_to_pattern)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn list_all(pool: &DbPool, limit: i64) -> Result<Vec<ValidationPattern>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM validation_patterns ORDER BY confidence DESC, updated_at DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], row_to_pattern)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn decay_all(pool: &DbPool) -> Result<usize, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE validation_patterns SET
            success_count = success_count / 2,
            failure_count = failure_count / 2,
            confidence = (success_count / 2 + 2.0) / (success_count / 2 + failure_count / 2 + 4.0),
            updated_at = ?1",
        params![now],
    )?;
    Ok(rows)
}
