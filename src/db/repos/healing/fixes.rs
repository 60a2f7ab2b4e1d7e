use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use crate::db::models::{AutoFix, CreateAutoFixInput, ErrorStatus, FixStatus};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_auto_fix(row: &Row) -> rusqlite::Result<AutoFix> {
    Ok(AutoFix {
        id: row.get("id")?,
        error_id: row.get("error_id")?,
        fix_type: row.get("fix_type")?,
        original_code: row.get("original_code")?,
        fixed_code: row.get("fixed_code")?,
        explanation: row.get("explanation")?,
        confidence: row.get("confidence")?,
        status: row.get("status")?,
        pattern_signature: row.get("pattern_signature")?,
        auto_apply_eligible: row.get::<_, i32>("auto_apply_eligible")? != 0,
        test_results: row.get("test_results")?,
        rollback_reason: row.get("rollback_reason")?,
        applied_at: row.get("applied_at")?,
        verified_at: row.get("verified_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Insert a new pending fix and move its error from `analyzing` to `fixing`.
///
/// Runs in one immediate transaction. Older pending fixes for the same error
/// are superseded (marked failed), so at most one fix per error is ever
/// pending. When the error is no longer `analyzing` nothing is written and
/// the call fails with `InvalidTransition`.
pub fn create(pool: &DbPool, input: CreateAutoFixInput) -> Result<AutoFix, AppError> {
    if !(0.0..=1.0).contains(&input.confidence) {
        return Err(AppError::Validation(format!(
            "Fix confidence must be within [0, 1], got {}",
            input.confidence
        )));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let moved = tx.execute(
        "UPDATE detected_errors SET status = 'fixing', updated_at = ?1
         WHERE id = ?2 AND status = 'analyzing'",
        params![now, input.error_id],
    )?;
    if moved == 0 {
        return Err(AppError::InvalidTransition(format!(
            "error {} is no longer being analyzed; fix discarded",
            input.error_id
        )));
    }

    let superseded = tx.execute(
        "UPDATE auto_fixes
         SET status = 'failed', test_results = 'superseded by a newer fix', updated_at = ?1
         WHERE error_id = ?2 AND status = 'pending'",
        params![now, input.error_id],
    )?;
    if superseded > 0 {
        tracing::debug!(error_id = %input.error_id, superseded, "Superseded pending fixes");
    }

    tx.execute(
        "INSERT INTO auto_fixes
         (id, error_id, fix_type, original_code, fixed_code, explanation, confidence,
          status, pattern_signature, auto_apply_eligible, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10, ?10)",
        params![
            id,
            input.error_id,
            input.fix_type,
            input.original_code,
            input.fixed_code,
            input.explanation,
            input.confidence,
            input.pattern_signature,
            input.auto_apply_eligible as i32,
            now,
        ],
    )?;
    tx.commit()?;

    get_by_id(pool, &id)
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<AutoFix, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM auto_fixes WHERE id = ?1",
        params![id],
        row_to_auto_fix,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("AutoFix {id}")),
        other => AppError::Database(other),
    })
}

pub fn list_for_error(pool: &DbPool, error_id: &str) -> Result<Vec<AutoFix>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM auto_fixes WHERE error_id = ?1 ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt.query_map(params![error_id], row_to_auto_fix)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Most recent fix for an error, if any.
pub fn latest_for_error(pool: &DbPool, error_id: &str) -> Result<Option<AutoFix>, AppError> {
    let conn = pool.get()?;
    let fix = conn
        .query_row(
            "SELECT * FROM auto_fixes WHERE error_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![error_id],
            row_to_auto_fix,
        )
        .optional()?;
    Ok(fix)
}

/// pending → applied. The owning error moves to `error_status` and its
/// canonical code becomes the fixed code, atomically with the fix.
///
/// Refused while the error is not `detected` or `fixing`, or while another
/// fix for it is still in effect.
pub fn mark_applied(
    pool: &DbPool,
    fix_id: &str,
    error_status: ErrorStatus,
) -> Result<AutoFix, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let owner: Option<(String, ErrorStatus)> = tx
        .query_row(
            "SELECT e.id, e.status FROM auto_fixes f
             JOIN detected_errors e ON e.id = f.error_id
             WHERE f.id = ?1",
            params![fix_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((error_id, current)) = owner else {
        return Err(AppError::NotFound(format!("AutoFix {fix_id}")));
    };

    let rows = tx.execute(
        "UPDATE auto_fixes SET status = 'applied', applied_at = ?1, updated_at = ?1
         WHERE id = ?2 AND status = 'pending'",
        params![now, fix_id],
    )?;
    if rows == 0 {
        return Err(transition_error(&tx, fix_id, "apply", "pending")?);
    }

    if !matches!(current, ErrorStatus::Detected | ErrorStatus::Fixing) {
        return Err(AppError::InvalidTransition(format!(
            "cannot apply fix {fix_id}: error {error_id} is {current}"
        )));
    }
    let in_effect: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM auto_fixes
                       WHERE error_id = ?1 AND id != ?2 AND status IN ('applied', 'verified'))",
        params![error_id, fix_id],
        |row| row.get(0),
    )?;
    if in_effect {
        return Err(AppError::InvalidTransition(format!(
            "cannot apply fix {fix_id}: another fix for error {error_id} is already applied"
        )));
    }

    tx.execute(
        "UPDATE detected_errors
         SET status = ?1,
             current_code = (SELECT fixed_code FROM auto_fixes WHERE id = ?2),
             updated_at = ?3,
             resolved_at = ?3
         WHERE id = ?4",
        params![error_status, fix_id, now, error_id],
    )?;
    tx.commit()?;

    get_by_id(pool, fix_id)
}

/// applied → verified | failed.
pub fn record_verification(
    pool: &DbPool,
    fix_id: &str,
    passed: bool,
    test_results: Option<&str>,
) -> Result<AutoFix, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let status = if passed { FixStatus::Verified } else { FixStatus::Failed };

    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE auto_fixes SET status = ?1, test_results = ?2, verified_at = ?3, updated_at = ?3
         WHERE id = ?4 AND status = 'applied'",
        params![status, test_results, now, fix_id],
    )?;
    if rows == 0 {
        return Err(transition_error(&conn, fix_id, "verify", "applied")?);
    }
    drop(conn);

    get_by_id(pool, fix_id)
}

/// applied | verified | failed-after-apply → rolled_back. The owning error
/// returns to `detected` and its canonical code reverts to the original.
pub fn mark_rolled_back(pool: &DbPool, fix_id: &str, reason: &str) -> Result<AutoFix, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    let rows = tx.execute(
        "UPDATE auto_fixes SET status = 'rolled_back', rollback_reason = ?1, updated_at = ?2
         WHERE id = ?3
           AND (status IN ('applied', 'verified')
                OR (status = 'failed' AND applied_at IS NOT NULL))",
        params![reason, now, fix_id],
    )?;
    if rows == 0 {
        return Err(transition_error(&tx, fix_id, "roll back", "applied")?);
    }

    tx.execute(
        "UPDATE detected_errors
         SET status = 'detected',
             current_code = (SELECT original_code FROM auto_fixes WHERE id = ?1),
             updated_at = ?2,
             resolved_at = NULL
         WHERE id = (SELECT error_id FROM auto_fixes WHERE id = ?1)",
        params![fix_id, now],
    )?;
    tx.commit()?;

    get_by_id(pool, fix_id)
}

/// Build the error for a rejected conditional update: NotFound when the fix
/// does not exist, InvalidTransition otherwise.
fn transition_error(
    conn: &rusqlite::Connection,
    fix_id: &str,
    action: &str,
    expected: &str,
) -> Result<AppError, AppError> {
    let current: Option<FixStatus> = conn
        .query_row(
            "SELECT status FROM auto_fixes WHERE id = ?1",
            params![fix_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match current {
        None => AppError::NotFound(format!("AutoFix {fix_id}")),
        Some(status) => AppError::InvalidTransition(format!(
            "cannot {action} fix {fix_id}: status is {status}, expected {expected}"
        )),
    })
}
