use rusqlite::Connection;

use crate::error::AppError;

/// Run the consolidated, idempotent schema migration.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Detected errors
-- ============================================================================

CREATE TABLE IF NOT EXISTS detected_errors (
    id                  TEXT PRIMARY KEY,
    error_type          TEXT NOT NULL,
    severity            TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'detected',
    message             TEXT NOT NULL,
    stack_trace         TEXT,
    context             TEXT,
    signature           TEXT NOT NULL,
    fix_attempt_count   INTEGER NOT NULL DEFAULT 0,
    auto_fix_disabled   INTEGER NOT NULL DEFAULT 0,
    current_code        TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    resolved_at         TEXT
);
CREATE INDEX IF NOT EXISTS idx_de_status     ON detected_errors(status);
CREATE INDEX IF NOT EXISTS idx_de_signature  ON detected_errors(signature);
CREATE INDEX IF NOT EXISTS idx_de_created    ON detected_errors(created_at);

-- ============================================================================
-- Auto fixes (error_id is a weak reference: no FK)
-- ============================================================================

CREATE TABLE IF NOT EXISTS auto_fixes (
    id                   TEXT PRIMARY KEY,
    error_id             TEXT NOT NULL,
    fix_type             TEXT NOT NULL,
    original_code        TEXT NOT NULL,
    fixed_code           TEXT NOT NULL,
    explanation          TEXT,
    confidence           REAL NOT NULL,
    status               TEXT NOT NULL DEFAULT 'pending',
    pattern_signature    TEXT,
    auto_apply_eligible  INTEGER NOT NULL DEFAULT 0,
    test_results         TEXT,
    rollback_reason      TEXT,
    applied_at           TEXT,
    verified_at          TEXT,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_af_error   ON auto_fixes(error_id, created_at);
CREATE INDEX IF NOT EXISTS idx_af_status  ON auto_fixes(status);

-- ============================================================================
-- Learned patterns
-- ============================================================================

CREATE TABLE IF NOT EXISTS error_patterns (
    signature          TEXT PRIMARY KEY,
    category           TEXT NOT NULL,
    description        TEXT NOT NULL,
    solution_template  TEXT NOT NULL,
    success_count      INTEGER NOT NULL DEFAULT 0,
    failure_count      INTEGER NOT NULL DEFAULT 0,
    confidence         REAL NOT NULL DEFAULT 0.5,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ep_category ON error_patterns(category, confidence DESC);

CREATE TABLE IF NOT EXISTS validation_patterns (
    signature          TEXT PRIMARY KEY,
    issue_type         TEXT NOT NULL,
    description        TEXT NOT NULL,
    fix_template       TEXT NOT NULL,
    success_count      INTEGER NOT NULL DEFAULT 0,
    failure_count      INTEGER NOT NULL DEFAULT 0,
    confidence         REAL NOT NULL DEFAULT 0.5,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vp_issue ON validation_patterns(issue_type, confidence DESC);

-- ============================================================================
-- Healing audit trail
-- ============================================================================

CREATE TABLE IF NOT EXISTS healing_audit (
    id          TEXT PRIMARY KEY,
    error_id    TEXT NOT NULL,
    fix_id      TEXT,
    event       TEXT NOT NULL,
    detail      TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ha_error ON healing_audit(error_id, created_at);

-- ============================================================================
-- Generation telemetry
-- ============================================================================

CREATE TABLE IF NOT EXISTS generation_results (
    id             TEXT PRIMARY KEY,
    request_id     TEXT NOT NULL,
    provider       TEXT NOT NULL,
    approach       TEXT NOT NULL,
    timeout_ms     INTEGER NOT NULL,
    priority       INTEGER NOT NULL,
    mode           TEXT NOT NULL,
    succeeded      INTEGER NOT NULL,
    quality_score  INTEGER NOT NULL,
    duration_ms    INTEGER NOT NULL,
    error_message  TEXT,
    file_count     INTEGER NOT NULL DEFAULT 0,
    is_winner      INTEGER NOT NULL DEFAULT 0,
    files_json     TEXT,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_gr_request   ON generation_results(request_id);
CREATE INDEX IF NOT EXISTS idx_gr_provider  ON generation_results(provider, approach);
CREATE INDEX IF NOT EXISTS idx_gr_created   ON generation_results(created_at);

-- ============================================================================
-- Schema versions (append-only)
-- ============================================================================

CREATE TABLE IF NOT EXISTS schema_versions (
    id                 TEXT PRIMARY KEY,
    version_number     INTEGER NOT NULL UNIQUE,
    version_label      TEXT NOT NULL,
    hash               TEXT NOT NULL,
    table_definitions  TEXT NOT NULL,
    captured_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_changes (
    id           TEXT PRIMARY KEY,
    version_id   TEXT NOT NULL REFERENCES schema_versions(id) ON DELETE CASCADE,
    change_type  TEXT NOT NULL,
    table_name   TEXT NOT NULL,
    column_name  TEXT,
    severity     TEXT NOT NULL,
    detail       TEXT NOT NULL,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sc_version ON schema_changes(version_id);

"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('detected_errors', 'auto_fixes', 'error_patterns', 'validation_patterns',
                  'healing_audit', 'generation_results', 'schema_versions', 'schema_changes')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 8);
    }
}
