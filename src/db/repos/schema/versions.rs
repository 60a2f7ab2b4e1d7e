use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::{SchemaChange, SchemaChangeRecord, SchemaVersion};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_version(row: &Row) -> rusqlite::Result<SchemaVersion> {
    Ok(SchemaVersion {
        id: row.get("id")?,
        version_number: row.get("version_number")?,
        version_label: row.get("version_label")?,
        hash: row.get("hash")?,
        table_definitions: row.get("table_definitions")?,
        captured_at: row.get("captured_at")?,
    })
}

fn row_to_change(row: &Row) -> rusqlite::Result<SchemaChangeRecord> {
    Ok(SchemaChangeRecord {
        id: row.get("id")?,
        version_id: row.get("version_id")?,
        change: SchemaChange {
            change_type: row.get("change_type")?,
            table_name: row.get("table_name")?,
            column_name: row.get("column_name")?,
            severity: row.get("severity")?,
            detail: row.get("detail")?,
        },
        created_at: row.get("created_at")?,
    })
}

pub fn latest(pool: &DbPool) -> Result<Option<SchemaVersion>, AppError> {
    let conn = pool.get()?;
    let version = conn
        .query_row(
            "SELECT * FROM schema_versions ORDER BY version_number DESC LIMIT 1",
            [],
            row_to_version,
        )
        .optional()?;
    Ok(version)
}

/// Append a new version with its change list. Version numbers are assigned
/// inside the transaction as `max + 1`, labelled `v{n}`.
pub fn insert(
    pool: &DbPool,
    hash: &str,
    table_definitions: &str,
    changes: &[SchemaChange],
) -> Result<SchemaVersion, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    let next: i64 = tx.query_row(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM schema_versions",
        [],
        |row| row.get(0),
    )?;
    let label = format!("v{next}");

    tx.execute(
        "INSERT INTO schema_versions (id, version_number, version_label, hash, table_definitions, captured_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, next, label, hash, table_definitions, now],
    )?;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO schema_changes
             (id, version_id, change_type, table_name, column_name, severity, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for change in changes {
            stmt.execute(params![
                uuid::Uuid::new_v4().to_string(),
                id,
                change.change_type,
                change.table_name,
                change.column_name,
                change.severity,
                change.detail,
                now,
            ])?;
        }
    }
    tx.commit()?;

    Ok(SchemaVersion {
        id,
        version_number: next,
        version_label: label,
        hash: hash.to_string(),
        table_definitions: table_definitions.to_string(),
        captured_at: now,
    })
}

pub fn list(pool: &DbPool, limit: i64) -> Result<Vec<SchemaVersion>, AppError> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT * FROM schema_versions ORDER BY version_number DESC LIMIT ?1")?;
    let rows = stmt.query_map(params![limit], row_to_version)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn changes_for_version(
    pool: &DbPool,
    version_id: &str,
) -> Result<Vec<SchemaChangeRecord>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM schema_changes WHERE version_id = ?1 ORDER BY rowid ASC",
    )?;
    let rows = stmt.query_map(params![version_id], row_to_change)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
