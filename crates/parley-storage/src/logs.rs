//! SQLite-backed log sink and log queries.

use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::ToSql;
use rusqlite::Row;
use uuid::Uuid;

use parley_core::error::ParleyError;
use parley_core::sink::{LogContext, LogLevel, LogRecord, LogSink, SinkError};

use crate::db::Database;

/// Default number of records returned by [`LogStore::query`].
pub const DEFAULT_QUERY_LIMIT: u32 = 100;

/// Upper bound on records returned by one query.
pub const MAX_QUERY_LIMIT: u32 = 1000;

/// Filters for [`LogStore::query`]. All filters are optional and combined with AND.
#[derive(Debug, Clone, Default)]
pub struct LogFilters {
    pub level: Option<LogLevel>,
    pub target: Option<String>,
    pub thread_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Persistent, append-only log store.
#[derive(Debug, Clone)]
pub struct LogStore {
    db: Arc<Database>,
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl LogStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert one record.
    pub fn insert(&self, record: &LogRecord) -> Result<(), ParleyError> {
        let extra = record
            .context
            .extra
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO logs (timestamp, level, target, message, cause,
                                   request_id, thread_id, run_id, extra)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    format_ts(&record.timestamp),
                    record.level.as_str(),
                    record.target,
                    record.message,
                    record.cause,
                    record.context.request_id.map(|id| id.to_string()),
                    record.context.thread_id,
                    record.context.run_id.map(|id| id.to_string()),
                    extra,
                ],
            )
            .map_err(|e| ParleyError::Storage(format!("Log insert: {}", e)))?;
            Ok(())
        })
    }

    /// Records matching `filters`, newest first.
    pub fn query(&self, filters: &LogFilters) -> Result<Vec<LogRecord>, ParleyError> {
        let mut sql = String::from(
            "SELECT timestamp, level, target, message, cause, request_id, thread_id, run_id, extra
             FROM logs WHERE 1=1",
        );
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(level) = filters.level {
            params_vec.push(Box::new(level.as_str().to_string()));
            sql.push_str(&format!(" AND level = ?{}", params_vec.len()));
        }
        if let Some(ref target) = filters.target {
            params_vec.push(Box::new(target.clone()));
            sql.push_str(&format!(" AND target = ?{}", params_vec.len()));
        }
        if let Some(ref thread_id) = filters.thread_id {
            params_vec.push(Box::new(thread_id.clone()));
            sql.push_str(&format!(" AND thread_id = ?{}", params_vec.len()));
        }
        if let Some(ref since) = filters.since {
            params_vec.push(Box::new(format_ts(since)));
            sql.push_str(&format!(" AND timestamp >= ?{}", params_vec.len()));
        }
        if let Some(ref until) = filters.until {
            params_vec.push(Box::new(format_ts(until)));
            sql.push_str(&format!(" AND timestamp <= ?{}", params_vec.len()));
        }

        let limit = filters
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT);
        params_vec.push(Box::new(i64::from(limit)));
        sql.push_str(&format!(
            " ORDER BY timestamp DESC, id DESC LIMIT ?{}",
            params_vec.len()
        ));

        self.db.with_conn(|conn| {
            let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| ParleyError::Storage(format!("Log query prepare: {}", e)))?;

            let rows = stmt
                .query_map(params_refs.as_slice(), |row| Ok(map_log_row(row)))
                .map_err(|e| ParleyError::Storage(format!("Log query: {}", e)))?;

            let mut results = Vec::new();
            for row in rows {
                let r = row.map_err(|e| ParleyError::Storage(e.to_string()))??;
                results.push(r);
            }
            Ok(results)
        })
    }

    /// Delete records older than `days` days. Returns the number removed.
    pub fn clear_older_than(&self, days: u32) -> Result<u64, ParleyError> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        self.db.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM logs WHERE timestamp < ?1",
                    rusqlite::params![format_ts(&cutoff)],
                )
                .map_err(|e| ParleyError::Storage(format!("Log purge: {}", e)))?;
            Ok(deleted as u64)
        })
    }

    pub fn count(&self) -> Result<u64, ParleyError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
                .map_err(|e| ParleyError::Storage(format!("Log count: {}", e)))?;
            Ok(n as u64)
        })
    }
}

impl LogSink for LogStore {
    fn append(&self, record: LogRecord) -> Result<(), SinkError> {
        self.insert(&record)
            .map_err(|e| SinkError::Write(e.to_string()))
    }
}

fn parse_uuid(raw: Option<String>) -> Option<Uuid> {
    raw.and_then(|s| Uuid::parse_str(&s).ok())
}

fn map_log_row(row: &Row<'_>) -> Result<LogRecord, ParleyError> {
    let get_err = |e: rusqlite::Error| ParleyError::Storage(format!("Log row: {}", e));

    let ts_raw: String = row.get(0).map_err(get_err)?;
    let timestamp = DateTime::parse_from_rfc3339(&ts_raw)
        .map_err(|e| ParleyError::Storage(format!("Bad log timestamp '{}': {}", ts_raw, e)))?
        .with_timezone(&Utc);

    let level_raw: String = row.get(1).map_err(get_err)?;
    let level = level_raw.parse::<LogLevel>().map_err(ParleyError::Storage)?;

    let extra_raw: Option<String> = row.get(8).map_err(get_err)?;
    let extra = extra_raw
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(LogRecord {
        timestamp,
        level,
        target: row.get(2).map_err(get_err)?,
        message: row.get(3).map_err(get_err)?,
        cause: row.get(4).map_err(get_err)?,
        context: LogContext {
            request_id: parse_uuid(row.get(5).map_err(get_err)?),
            thread_id: row.get(6).map_err(get_err)?,
            run_id: parse_uuid(row.get(7).map_err(get_err)?),
            extra,
        },
    })
}
