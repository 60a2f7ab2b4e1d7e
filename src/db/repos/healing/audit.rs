use rusqlite::{params, Row};

use crate::db::models::HealingAuditEntry;
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_entry(row: &Row) -> rusqlite::Result<HealingAuditEntry> {
    Ok(HealingAuditEntry {
        id: row.get("id")?,
        error_id: row.get("error_id")?,
        fix_id: row.get("fix_id")?,
        event: row.get("event")?,
        detail: row.get("detail")?,
        created_at: row.get("created_at")?,
    })
}

pub fn record(
    pool: &DbPool,
    error_id: &str,
    fix_id: Option<&str>,
    event: &str,
    detail: Option<&str>,
) -> Result<(), AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO healing_audit (id, error_id, fix_id, event, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, error_id, fix_id, event, detail, now],
    )?;
    Ok(())
}

pub fn list_for_error(pool: &DbPool, error_id: &str) -> Result<Vec<HealingAuditEntry>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM healing_audit WHERE error_id = ?1 ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map(params![error_id], row_to_entry)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn test_audit_trail_order() {
        let pool = init_test_db().unwrap();
        record(&pool, "e1", None, "detected", None).unwrap();
        record(&pool, "e1", Some("f1"), "fix_generated", Some("confidence 0.90")).unwrap();
        record(&pool, "e2", None, "detected", None).unwrap();

        let trail = list_for_error(&pool, "e1").unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].event, "detected");
        assert_eq!(trail[1].fix_id.as_deref(), Some("f1"));
    }
}
