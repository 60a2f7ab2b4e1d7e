//! Schema drift detection for an external application database.
//!
//! Each tick captures table/column metadata, hashes a canonical JSON
//! rendering, and compares it with the latest stored version. A changed hash
//! produces a structural diff, a new version, and a [`SchemaSignal`] on a
//! watch channel. The monitor never acts on the signal itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};

use crate::db::models::{SchemaChange, SchemaChangeType, SchemaVersion, Severity};
use crate::db::repos::schema::versions as version_repo;
use crate::db::DbPool;
use crate::error::AppError;

// ============================================================================
// Snapshot model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub primary_key: bool,
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

/// Where table metadata comes from.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn capture(&self) -> Result<Vec<TableDef>, AppError>;
}

/// Reads `sqlite_master` and `pragma_table_info` of a SQLite database.
pub struct SqliteSchemaSource {
    pool: DbPool,
}

impl SqliteSchemaSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn capture_blocking(pool: &DbPool) -> Result<Vec<TableDef>, AppError> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT m.name AS table_name, p.name AS column_name, p.type AS data_type,
                    p.\"notnull\" AS not_null, p.pk AS pk, p.dflt_value AS default_value
             FROM sqlite_master m
             JOIN pragma_table_info(m.name) p
             WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%'
             ORDER BY m.name, p.cid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>("table_name")?,
                ColumnDef {
                    name: row.get("column_name")?,
                    data_type: row.get("data_type")?,
                    not_null: row.get::<_, i64>("not_null")? != 0,
                    primary_key: row.get::<_, i64>("pk")? != 0,
                    default_value: row.get("default_value")?,
                },
            ))
        })?;

        let mut tables: BTreeMap<String, Vec<ColumnDef>> = BTreeMap::new();
        for row in rows {
            let (table, column) = row?;
            tables.entry(table).or_default().push(column);
        }
        Ok(tables
            .into_iter()
            .map(|(name, columns)| TableDef { name, columns })
            .collect())
    }
}

#[async_trait]
impl SchemaSource for SqliteSchemaSource {
    async fn capture(&self) -> Result<Vec<TableDef>, AppError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || Self::capture_blocking(&pool))
            .await
            .map_err(|e| AppError::Internal(format!("schema capture task failed: {e}")))?
    }
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Tables by name, columns by name. Column order is not structural.
pub fn canonicalize(mut tables: Vec<TableDef>) -> Vec<TableDef> {
    for t in &mut tables {
        t.columns.sort_by(|a, b| a.name.cmp(&b.name));
    }
    tables.sort_by(|a, b| a.name.cmp(&b.name));
    tables
}

/// sha256 of the canonical JSON rendering. Input must be canonicalized.
pub fn schema_hash(canonical_json: &str) -> String {
    hex::encode(Sha256::digest(canonical_json.as_bytes()))
}

pub fn severity_for(change_type: SchemaChangeType) -> Severity {
    match change_type {
        SchemaChangeType::TableRemoved => Severity::High,
        SchemaChangeType::ColumnRemoved => Severity::Critical,
        SchemaChangeType::TableAdded => Severity::High,
        SchemaChangeType::ColumnAdded => Severity::Medium,
        SchemaChangeType::ColumnModified => Severity::Medium,
    }
}

fn change(
    change_type: SchemaChangeType,
    table: &str,
    column: Option<&str>,
    detail: String,
) -> SchemaChange {
    SchemaChange {
        change_type,
        table_name: table.to_string(),
        column_name: column.map(str::to_string),
        severity: severity_for(change_type),
        detail,
    }
}

/// Structural diff from `old` to `new`, ordered by table then column.
pub fn diff(old: &[TableDef], new: &[TableDef]) -> Vec<SchemaChange> {
    let old_tables: BTreeMap<&str, &TableDef> = old.iter().map(|t| (t.name.as_str(), t)).collect();
    let new_tables: BTreeMap<&str, &TableDef> = new.iter().map(|t| (t.name.as_str(), t)).collect();
    let mut changes = Vec::new();

    for (name, old_table) in &old_tables {
        if !new_tables.contains_key(name) {
            changes.push(change(
                SchemaChangeType::TableRemoved,
                name,
                None,
                format!("table {name} removed ({} columns)", old_table.columns.len()),
            ));
        }
    }

    for (name, new_table) in &new_tables {
        let Some(old_table) = old_tables.get(name) else {
            changes.push(change(
                SchemaChangeType::TableAdded,
                name,
                None,
                format!("table {name} added ({} columns)", new_table.columns.len()),
            ));
            continue;
        };

        let old_cols: BTreeMap<&str, &ColumnDef> =
            old_table.columns.iter().map(|c| (c.name.as_str(), c)).collect();
        let new_cols: BTreeMap<&str, &ColumnDef> =
            new_table.columns.iter().map(|c| (c.name.as_str(), c)).collect();

        for col in old_cols.keys() {
            if !new_cols.contains_key(col) {
                changes.push(change(
                    SchemaChangeType::ColumnRemoved,
                    name,
                    Some(*col),
                    format!("column {name}.{col} removed"),
                ));
            }
        }
        for (col, new_col) in &new_cols {
            match old_cols.get(col) {
                None => changes.push(change(
                    SchemaChangeType::ColumnAdded,
                    name,
                    Some(*col),
                    format!("column {name}.{col} added ({})", new_col.data_type),
                )),
                Some(old_col) if old_col != new_col => changes.push(change(
                    SchemaChangeType::ColumnModified,
                    name,
                    Some(*col),
                    describe_modification(old_col, new_col),
                )),
                Some(_) => {}
            }
        }
    }

    changes
}

fn describe_modification(old: &ColumnDef, new: &ColumnDef) -> String {
    let mut parts = Vec::new();
    if old.data_type != new.data_type {
        parts.push(format!("type {} -> {}", old.data_type, new.data_type));
    }
    if old.not_null != new.not_null {
        parts.push(format!("not_null {} -> {}", old.not_null, new.not_null));
    }
    if old.primary_key != new.primary_key {
        parts.push(format!("primary_key {} -> {}", old.primary_key, new.primary_key));
    }
    if old.default_value != new.default_value {
        parts.push(format!("default {:?} -> {:?}", old.default_value, new.default_value));
    }
    format!("column {} modified: {}", new.name, parts.join(", "))
}

/// What downstream consumers should do about a schema change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSignal {
    pub version_number: i64,
    pub requires_cache_invalidation: bool,
    pub requires_pattern_update: bool,
    pub change_count: usize,
}

impl SchemaSignal {
    pub fn from_changes(version_number: i64, changes: &[SchemaChange]) -> Self {
        Self {
            version_number,
            requires_cache_invalidation: changes
                .iter()
                .any(|c| matches!(c.severity, Severity::High | Severity::Critical)),
            requires_pattern_update: changes.iter().any(|c| {
                matches!(
                    c.change_type,
                    SchemaChangeType::ColumnAdded
                        | SchemaChangeType::ColumnRemoved
                        | SchemaChangeType::TableAdded
                )
            }),
            change_count: changes.len(),
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// First capture: stored, no flags raised.
    Baseline { version: SchemaVersion },
    Unchanged,
    Changed {
        version: SchemaVersion,
        changes: Vec<SchemaChange>,
        signal: SchemaSignal,
    },
    /// Another tick was still running.
    Skipped,
}

pub struct SchemaChangeMonitor {
    pool: DbPool,
    source: Arc<dyn SchemaSource>,
    tick_guard: Mutex<()>,
    signals: watch::Sender<Option<SchemaSignal>>,
}

impl SchemaChangeMonitor {
    /// `pool` is where versions are stored, not the watched database.
    pub fn new(pool: DbPool, source: Arc<dyn SchemaSource>) -> Self {
        let (signals, _) = watch::channel(None);
        Self {
            pool,
            source,
            tick_guard: Mutex::new(()),
            signals,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SchemaSignal>> {
        self.signals.subscribe()
    }

    pub async fn check_once(&self) -> Result<TickOutcome, AppError> {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            tracing::debug!("Schema check already in progress, skipping tick");
            return Ok(TickOutcome::Skipped);
        };

        let tables = canonicalize(self.source.capture().await?);
        let definitions = serde_json::to_string(&tables)?;
        let hash = schema_hash(&definitions);

        let pool = &self.pool;
        let latest = version_repo::latest(pool)?;

        let Some(previous) = latest else {
            let version = version_repo::insert(pool, &hash, &definitions, &[])?;
            tracing::info!(version = %version.version_label, tables = tables.len(), "Schema baseline captured");
            return Ok(TickOutcome::Baseline { version });
        };

        if previous.hash == hash {
            return Ok(TickOutcome::Unchanged);
        }

        let old_tables: Vec<TableDef> = serde_json::from_str(&previous.table_definitions)?;
        let changes = diff(&old_tables, &tables);
        let version = version_repo::insert(pool, &hash, &definitions, &changes)?;
        let signal = SchemaSignal::from_changes(version.version_number, &changes);

        tracing::warn!(
            version = %version.version_label,
            changes = changes.len(),
            invalidate_cache = signal.requires_cache_invalidation,
            update_patterns = signal.requires_pattern_update,
            "Schema change detected"
        );

        self.signals.send_replace(Some(signal.clone()));
        Ok(TickOutcome::Changed {
            version,
            changes,
            signal,
        })
    }
}
