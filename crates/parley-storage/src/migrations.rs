//! Database schema migrations.

use rusqlite::Connection;
use tracing::info;

use parley_core::error::ParleyError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), ParleyError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| ParleyError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| ParleyError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: log_records");
    }

    Ok(())
}

/// Version 1: append-only log table.
///
/// Timestamps are RFC 3339 UTC strings with a fixed width, so text ordering
/// matches chronological ordering.
fn apply_v1(conn: &Connection) -> Result<(), ParleyError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp   TEXT NOT NULL,
            level       TEXT NOT NULL
                        CHECK (level IN ('TRACE', 'DEBUG', 'INFO', 'WARN', 'ERROR')),
            target      TEXT NOT NULL,
            message     TEXT NOT NULL,
            cause       TEXT,
            request_id  TEXT,
            thread_id   TEXT,
            run_id      TEXT,
            extra       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs (timestamp);
        CREATE INDEX IF NOT EXISTS idx_logs_level ON logs (level);
        CREATE INDEX IF NOT EXISTS idx_logs_thread ON logs (thread_id);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'log_records');
        ",
    )
    .map_err(|e| ParleyError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}
