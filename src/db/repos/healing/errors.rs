use rusqlite::{params, Row};

use crate::db::models::{CreateDetectedErrorInput, DetectedError, ErrorStatus};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_detected_error(row: &Row) -> rusqlite::Result<DetectedError> {
    Ok(DetectedError {
        id: row.get("id")?,
        error_type: row.get("error_type")?,
        severity: row.get("severity")?,
        status: row.get("status")?,
        message: row.get("message")?,
        stack_trace: row.get("stack_trace")?,
        context: row.get("context")?,
        signature: row.get("signature")?,
        fix_attempt_count: row.get("fix_attempt_count")?,
        auto_fix_disabled: row.get::<_, i32>("auto_fix_disabled")? != 0,
        current_code: row.get("current_code")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        resolved_at: row.get("resolved_at")?,
    })
}

pub fn create(pool: &DbPool, input: CreateDetectedErrorInput) -> Result<DetectedError, AppError> {
    if input.message.trim().is_empty() {
        return Err(AppError::Validation("Error message cannot be empty".into()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO detected_errors
         (id, error_type, severity, status, message, stack_trace, context, signature,
          fix_attempt_count, auto_fix_disabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'detected', ?4, ?5, ?6, ?7, 0, 0, ?8, ?8)",
        params![
            id,
            input.error_type,
            input.severity,
            input.message,
            input.stack_trace,
            input.context,
            input.signature,
            now,
        ],
    )?;

    get_by_id(pool, &id)
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<DetectedError, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM detected_errors WHERE id = ?1",
        params![id],
        row_to_detected_error,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("DetectedError {id}")),
        other => AppError::Database(other),
    })
}

pub fn list(
    pool: &DbPool,
    status: Option<ErrorStatus>,
    limit: Option<i64>,
) -> Result<Vec<DetectedError>, AppError> {
    let conn = pool.get()?;
    let limit = limit.unwrap_or(100);

    let rows = match status {
        Some(st) => {
            let mut stmt = conn.prepare(
                "SELECT * FROM detected_errors WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![st, limit], row_to_detected_error)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt =
                conn.prepare("SELECT * FROM detected_errors ORDER BY created_at DESC LIMIT ?1")?;
            let rows = stmt.query_map(params![limit], row_to_detected_error)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(rows)
}

/// Set the status. Terminal statuses stamp `resolved_at`; returning to
/// `detected` clears it.
pub fn update_status(pool: &DbPool, id: &str, status: ErrorStatus) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;

    let rows = if status.is_terminal() {
        conn.execute(
            "UPDATE detected_errors SET status = ?1, updated_at = ?2, resolved_at = ?2 WHERE id = ?3",
            params![status, now, id],
        )?
    } else {
        conn.execute(
            "UPDATE detected_errors SET status = ?1, updated_at = ?2, resolved_at = NULL WHERE id = ?3",
            params![status, now, id],
        )?
    };

    if rows == 0 {
        return Err(AppError::NotFound(format!("DetectedError {id}")));
    }
    Ok(())
}

/// Result of trying to start a fix attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixAttempt {
    /// An attempt was consumed and the error is now `analyzing`.
    Started,
    /// The error is still fixable but its attempt budget is spent.
    Exhausted,
    /// The error is resolved, failed, or has auto-fix disabled.
    NotFixable,
}

/// Atomically consume one fix attempt and move the error to `analyzing`.
///
/// A single conditional UPDATE so that concurrent callers cannot both take
/// the last attempt. When it matches nothing the row is re-read to tell an
/// exhausted budget apart from an error that is simply not fixable.
pub fn begin_fix_attempt(pool: &DbPool, id: &str, max_attempts: u32) -> Result<FixAttempt, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE detected_errors
         SET fix_attempt_count = fix_attempt_count + 1,
             status = 'analyzing',
             updated_at = ?1
         WHERE id = ?2
           AND fix_attempt_count < ?3
           AND auto_fix_disabled = 0
           AND status IN ('detected', 'analyzing', 'fixing')",
        params![now, id, max_attempts],
    )?;
    if rows > 0 {
        return Ok(FixAttempt::Started);
    }

    let exhausted: bool = conn
        .query_row(
            "SELECT auto_fix_disabled = 0
                    AND status IN ('detected', 'analyzing', 'fixing')
                    AND fix_attempt_count >= ?2
             FROM detected_errors WHERE id = ?1",
            params![id, max_attempts],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("DetectedError {id}")),
            other => AppError::Database(other),
        })?;
    Ok(if exhausted {
        FixAttempt::Exhausted
    } else {
        FixAttempt::NotFixable
    })
}

/// Terminal failure: the attempt budget is spent and auto-fix is disabled.
///
/// Only applies while the error is unresolved with its budget spent;
/// returns `false` when another transition got there first.
pub fn mark_exhausted(pool: &DbPool, id: &str, max_attempts: u32) -> Result<bool, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE detected_errors
         SET status = 'failed', auto_fix_disabled = 1, updated_at = ?1, resolved_at = ?1
         WHERE id = ?2
           AND fix_attempt_count >= ?3
           AND status IN ('detected', 'analyzing', 'fixing')",
        params![now, id, max_attempts],
    )?;
    Ok(rows > 0)
}

/// analyzing → detected after an attempt produced no fix. Returns `false`
/// when the error has already moved on.
pub fn release_attempt(pool: &DbPool, id: &str) -> Result<bool, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE detected_errors SET status = 'detected', updated_at = ?1
         WHERE id = ?2 AND status = 'analyzing'",
        params![now, id],
    )?;
    Ok(rows > 0)
}

pub fn set_current_code(pool: &DbPool, id: &str, code: &str) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    conn.execute(
        "UPDATE detected_errors SET current_code = ?1, updated_at = ?2 WHERE id = ?3",
        params![code, now, id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::{ErrorType, Severity};

    fn input(message: &str) -> CreateDetectedErrorInput {
        CreateDetectedErrorInput {
            error_type: ErrorType::TypeError,
            severity: Severity::High,
            message: message.into(),
            stack_trace: Some("at render (App.jsx:12)".into()),
            context: None,
            signature: "sig-1".into(),
        }
    }

    #[test]
    fn test_detected_error_crud() {
        let pool = init_test_db().unwrap();

        let err = create(&pool, input("TypeError: x is undefined")).unwrap();
        assert_eq!(err.status, ErrorStatus::Detected);
        assert_eq!(err.fix_attempt_count, 0);
        assert!(!err.auto_fix_disabled);
        assert!(err.resolved_at.is_none());

        let fetched = get_by_id(&pool, &err.id).unwrap();
        assert_eq!(fetched.error_type, ErrorType::TypeError);
        assert_eq!(fetched.severity, Severity::High);

        update_status(&pool, &err.id, ErrorStatus::Fixed).unwrap();
        let fixed = get_by_id(&pool, &err.id).unwrap();
        assert_eq!(fixed.status, ErrorStatus::Fixed);
        assert!(fixed.resolved_at.is_some());

        update_status(&pool, &err.id, ErrorStatus::Detected).unwrap();
        assert!(get_by_id(&pool, &err.id).unwrap().resolved_at.is_none());

        assert_eq!(list(&pool, None, None).unwrap().len(), 1);
        assert_eq!(list(&pool, Some(ErrorStatus::Failed), None).unwrap().len(), 0);

        assert!(matches!(get_by_id(&pool, "missing"), Err(AppError::NotFound(_))));
        assert!(create(&pool, input("   ")).is_err());
    }

    #[test]
    fn test_begin_fix_attempt_respects_cap() {
        let pool = init_test_db().unwrap();
        let err = create(&pool, input("TypeError")).unwrap();

        for _ in 0..3 {
            assert_eq!(begin_fix_attempt(&pool, &err.id, 3).unwrap(), FixAttempt::Started);
        }
        assert_eq!(begin_fix_attempt(&pool, &err.id, 3).unwrap(), FixAttempt::Exhausted);

        let after = get_by_id(&pool, &err.id).unwrap();
        assert_eq!(after.fix_attempt_count, 3);
        assert_eq!(after.status, ErrorStatus::Analyzing);

        assert!(mark_exhausted(&pool, &err.id, 3).unwrap());
        let failed = get_by_id(&pool, &err.id).unwrap();
        assert_eq!(failed.status, ErrorStatus::Failed);
        assert!(failed.auto_fix_disabled);
        assert_eq!(begin_fix_attempt(&pool, &err.id, 3).unwrap(), FixAttempt::NotFixable);
    }

    #[test]
    fn test_fixed_error_is_not_fixable_and_never_exhausted() {
        let pool = init_test_db().unwrap();
        let err = create(&pool, input("TypeError")).unwrap();
        assert_eq!(begin_fix_attempt(&pool, &err.id, 3).unwrap(), FixAttempt::Started);
        update_status(&pool, &err.id, ErrorStatus::FixedAuto).unwrap();

        assert_eq!(begin_fix_attempt(&pool, &err.id, 3).unwrap(), FixAttempt::NotFixable);
        assert!(!mark_exhausted(&pool, &err.id, 3).unwrap());
        assert!(!mark_exhausted(&pool, &err.id, 1).unwrap());

        let after = get_by_id(&pool, &err.id).unwrap();
        assert_eq!(after.status, ErrorStatus::FixedAuto);
        assert!(!after.auto_fix_disabled);
        assert!(matches!(
            begin_fix_attempt(&pool, "missing", 3),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_release_attempt_only_from_analyzing() {
        let pool = init_test_db().unwrap();
        let err = create(&pool, input("TypeError")).unwrap();
        assert!(!release_attempt(&pool, &err.id).unwrap());

        begin_fix_attempt(&pool, &err.id, 3).unwrap();
        assert!(release_attempt(&pool, &err.id).unwrap());
        assert_eq!(get_by_id(&pool, &err.id).unwrap().status, ErrorStatus::Detected);
    }
}
