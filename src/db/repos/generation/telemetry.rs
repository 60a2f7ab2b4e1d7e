use rusqlite::{params, Row};

use crate::db::models::{CreateTelemetryInput, GenerationTelemetry, StrategyPerformance};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_telemetry(row: &Row) -> rusqlite::Result<GenerationTelemetry> {
    Ok(GenerationTelemetry {
        id: row.get("id")?,
        request_id: row.get("request_id")?,
        provider: row.get("provider")?,
        approach: row.get("approach")?,
        timeout_ms: row.get("timeout_ms")?,
        priority: row.get("priority")?,
        mode: row.get("mode")?,
        succeeded: row.get::<_, i32>("succeeded")? != 0,
        quality_score: row.get("quality_score")?,
        duration_ms: row.get("duration_ms")?,
        error_message: row.get("error_message")?,
        file_count: row.get("file_count")?,
        is_winner: row.get::<_, i32>("is_winner")? != 0,
        files_json: row.get("files_json")?,
        created_at: row.get("created_at")?,
    })
}

pub fn record(pool: &DbPool, input: CreateTelemetryInput) -> Result<GenerationTelemetry, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO generation_results
         (id, request_id, provider, approach, timeout_ms, priority, mode, succeeded,
          quality_score, duration_ms, error_message, file_count, is_winner, files_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            id,
            input.request_id,
            input.provider,
            input.approach,
            input.timeout_ms as i64,
            input.priority as i64,
            input.mode,
            input.succeeded as i32,
            input.quality_score,
            input.duration_ms as i64,
            input.error_message,
            input.file_count as i64,
            input.is_winner as i32,
            input.files_json,
            now,
        ],
    )?;

    Ok(GenerationTelemetry {
        id,
        request_id: input.request_id,
        provider: input.provider,
        approach: input.approach,
        timeout_ms: input.timeout_ms as i64,
        priority: input.priority as i64,
        mode: input.mode,
        succeeded: input.succeeded,
        quality_score: input.quality_score as i64,
        duration_ms: input.duration_ms as i64,
        error_message: input.error_message,
        file_count: input.file_count as i64,
        is_winner: input.is_winner,
        files_json: input.files_json,
        created_at: now,
    })
}

pub fn list_for_request(
    pool: &DbPool,
    request_id: &str,
) -> Result<Vec<GenerationTelemetry>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM generation_results WHERE request_id = ?1 ORDER BY priority ASC, created_at ASC",
    )?;
    let rows = stmt.query_map(params![request_id], row_to_telemetry)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Per (provider, approach) aggregates over the last `days` days.
pub fn strategy_performance(pool: &DbPool, days: i64) -> Result<Vec<StrategyPerformance>, AppError> {
    let cutoff = (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT provider, approach,
                COUNT(*) AS attempts,
                COALESCE(SUM(succeeded), 0) AS successes,
                COALESCE(SUM(is_winner), 0) AS wins,
                COALESCE(AVG(CASE WHEN succeeded = 1 THEN quality_score END), 0.0) AS avg_quality_score,
                COALESCE(AVG(duration_ms), 0.0) AS avg_duration_ms
         FROM generation_results
         WHERE created_at >= ?1
         GROUP BY provider, approach
         ORDER BY wins DESC, avg_quality_score DESC",
    )?;
    let rows = stmt.query_map(params![cutoff], |row| {
        Ok(StrategyPerformance {
            provider: row.get("provider")?,
            approach: row.get("approach")?,
            attempts: row.get("attempts")?,
            successes: row.get("successes")?,
            wins: row.get("wins")?,
            avg_quality_score: row.get("avg_quality_score")?,
            avg_duration_ms: row.get("avg_duration_ms")?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Delete telemetry older than `days` days. Returns rows removed.
pub fn cleanup(pool: &DbPool, days: i64) -> Result<usize, AppError> {
    let cutoff = (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();
    let conn = pool.get()?;
    let rows = conn.execute(
        "DELETE FROM generation_results WHERE created_at < ?1",
        params![cutoff],
    )?;
    Ok(rows)
}
