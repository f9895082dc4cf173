//! SQLite storage port
//!
//! Timestamps are stored as unix milliseconds, payloads as JSON text.
//!
//! Every method locks one `parking_lot::Mutex<Connection>` and runs the query
//! inline on the calling task. Statements are single-row or indexed, so this
//! blocks the runtime thread only briefly; callers serving many concurrent
//! tasks against a slow disk should wrap calls in `spawn_blocking` or use one
//! store per worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::info;

use super::{GuardStore, StoreError};
use crate::classifier::ErrorCategory;
use crate::correction::CorrectionStrategy;
use crate::types::{CacheEntry, CallRecord, CorrectionRecord, ExecutionStatus, ReflectionMemory};

const CALL_COLUMNS: &str = "id, session_id, tenant_id, tool_name, parameters_fingerprint, \
     execution_status, error_type, error_message, is_redundant, original_call_id, \
     redundant_reason, retry_count, recovered, recovery_strategy, duration_ms, \
     input_tokens, output_tokens, created_at, updated_at";

const CACHE_COLUMNS: &str = "cache_key, session_id, tool_name, fingerprint, cached_payload, \
     originating_call_id, expires_at, hit_count, created_at";

const CORRECTION_COLUMNS: &str = "id, tool_call_id, tenant_id, session_id, error_type, \
     error_category, correction_strategy, correction_rounds, correction_success, \
     final_status, created_at";

const REFLECTION_COLUMNS: &str = "id, tenant_id, tool_name, original_error, reflection_content, \
     correction_strategy, was_successful, created_at";

/// Guard store with SQLite backend
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the guard database
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn)?;

        info!("Guard store opened: {}", path.display());
        Ok(store)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tool_calls (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            tenant_id TEXT,
            tool_name TEXT NOT NULL,
            parameters_fingerprint TEXT NOT NULL,
            execution_status TEXT NOT NULL,
            error_type TEXT,
            error_message TEXT,
            is_redundant INTEGER NOT NULL DEFAULT 0,
            original_call_id TEXT,
            redundant_reason TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            recovered INTEGER NOT NULL DEFAULT 0,
            recovery_strategy TEXT,
            duration_ms INTEGER,
            input_tokens INTEGER,
            output_tokens INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tool_calls_lookup
            ON tool_calls(session_id, tool_name, parameters_fingerprint, created_at DESC);

        CREATE TABLE IF NOT EXISTS tool_cache (
            cache_key TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            cached_payload TEXT NOT NULL,
            originating_call_id TEXT,
            expires_at INTEGER NOT NULL,
            hit_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tool_cache_session ON tool_cache(session_id);
        CREATE INDEX IF NOT EXISTS idx_tool_cache_expires ON tool_cache(expires_at);

        CREATE TABLE IF NOT EXISTS corrections (
            id TEXT PRIMARY KEY,
            tool_call_id TEXT NOT NULL,
            tenant_id TEXT,
            session_id TEXT,
            error_type TEXT,
            error_category TEXT NOT NULL,
            correction_strategy TEXT NOT NULL,
            correction_rounds INTEGER NOT NULL,
            correction_success INTEGER NOT NULL DEFAULT 0,
            final_status TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_corrections_tool_call
            ON corrections(tool_call_id, created_at);

        CREATE TABLE IF NOT EXISTS reflections (
            id TEXT PRIMARY KEY,
            tenant_id TEXT,
            tool_name TEXT NOT NULL,
            original_error TEXT NOT NULL,
            reflection_content TEXT NOT NULL,
            correction_strategy TEXT NOT NULL,
            was_successful INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_reflections_tool
            ON reflections(tool_name, created_at DESC);
        "#,
    )?;

    Ok(())
}

fn conversion_error(idx: usize, ty: Type, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, msg.into())
}

fn ts_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, Type::Integer, format!("timestamp out of range: {}", ms)))
}

fn enum_col<T>(row: &Row, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, Type::Text, format!("unrecognized value '{}'", raw)))
}

fn count_col(row: &Row, idx: usize) -> rusqlite::Result<u64> {
    let n: i64 = row.get(idx)?;
    Ok(n.max(0) as u64)
}

fn opt_count_col(row: &Row, idx: usize) -> rusqlite::Result<Option<u64>> {
    let n: Option<i64> = row.get(idx)?;
    Ok(n.map(|n| n.max(0) as u64))
}

fn call_from_row(row: &Row) -> rusqlite::Result<CallRecord> {
    Ok(CallRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        tenant_id: row.get(2)?,
        tool_name: row.get(3)?,
        parameters_fingerprint: row.get(4)?,
        execution_status: enum_col(row, 5, ExecutionStatus::parse)?,
        error_type: row.get(6)?,
        error_message: row.get(7)?,
        is_redundant: row.get(8)?,
        original_call_id: row.get(9)?,
        redundant_reason: row.get(10)?,
        retry_count: count_col(row, 11)?.min(u32::MAX as u64) as u32,
        recovered: row.get(12)?,
        recovery_strategy: row.get(13)?,
        duration_ms: opt_count_col(row, 14)?,
        input_tokens: opt_count_col(row, 15)?,
        output_tokens: opt_count_col(row, 16)?,
        created_at: ts_col(row, 17)?,
        updated_at: ts_col(row, 18)?,
    })
}

fn cache_from_row(row: &Row) -> rusqlite::Result<CacheEntry> {
    let payload: String = row.get(4)?;
    let cached_payload = serde_json::from_str(&payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(CacheEntry {
        cache_key: row.get(0)?,
        session_id: row.get(1)?,
        tool_name: row.get(2)?,
        fingerprint: row.get(3)?,
        cached_payload,
        originating_call_id: row.get(5)?,
        expires_at: ts_col(row, 6)?,
        hit_count: count_col(row, 7)?,
        created_at: ts_col(row, 8)?,
    })
}

fn correction_from_row(row: &Row) -> rusqlite::Result<CorrectionRecord> {
    Ok(CorrectionRecord {
        id: row.get(0)?,
        tool_call_id: row.get(1)?,
        tenant_id: row.get(2)?,
        session_id: row.get(3)?,
        error_type: row.get(4)?,
        error_category: enum_col(row, 5, ErrorCategory::parse)?,
        correction_strategy: enum_col(row, 6, CorrectionStrategy::parse)?,
        correction_rounds: count_col(row, 7)?.min(u32::MAX as u64) as u32,
        correction_success: row.get(8)?,
        final_status: row.get(9)?,
        created_at: ts_col(row, 10)?,
    })
}

fn reflection_from_row(row: &Row) -> rusqlite::Result<ReflectionMemory> {
    Ok(ReflectionMemory {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        tool_name: row.get(2)?,
        original_error: row.get(3)?,
        reflection_content: row.get(4)?,
        correction_strategy: enum_col(row, 5, CorrectionStrategy::parse)?,
        was_successful: row.get(6)?,
        created_at: ts_col(row, 7)?,
    })
}

fn opt_i64(n: Option<u64>) -> Option<i64> {
    n.map(|n| n.min(i64::MAX as u64) as i64)
}

#[async_trait]
impl GuardStore for SqliteStore {
    async fn lookup_valid_cache(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM tool_cache WHERE cache_key = ?1 AND expires_at > ?2",
            CACHE_COLUMNS
        );
        let entry = conn
            .query_row(&sql, params![key, now.timestamp_millis()], cache_from_row)
            .optional()?;
        Ok(entry)
    }

    async fn find_recent_call(
        &self,
        session_id: &str,
        tool_name: &str,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CallRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM tool_calls
             WHERE session_id = ?1 AND tool_name = ?2 AND parameters_fingerprint = ?3
               AND created_at >= ?4
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1",
            CALL_COLUMNS
        );
        let record = conn
            .query_row(
                &sql,
                params![session_id, tool_name, fingerprint, since.timestamp_millis()],
                call_from_row,
            )
            .optional()?;
        Ok(record)
    }

    async fn save_cache(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&entry.cached_payload)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO tool_cache (cache_key, session_id, tool_name, fingerprint, cached_payload,
                                    originating_call_id, expires_at, hit_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(cache_key) DO UPDATE SET
                cached_payload = excluded.cached_payload,
                originating_call_id = excluded.originating_call_id,
                expires_at = excluded.expires_at,
                hit_count = excluded.hit_count
            "#,
            params![
                entry.cache_key,
                entry.session_id,
                entry.tool_name,
                entry.fingerprint,
                payload,
                entry.originating_call_id,
                entry.expires_at.timestamp_millis(),
                entry.hit_count.min(i64::MAX as u64) as i64,
                entry.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn find_cache_by_key(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM tool_cache WHERE cache_key = ?1", CACHE_COLUMNS);
        let entry = conn.query_row(&sql, params![key], cache_from_row).optional()?;
        Ok(entry)
    }

    async fn delete_cache_for_session(&self, session_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM tool_cache WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(removed as u64)
    }

    async fn delete_expired_cache(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM tool_cache WHERE expires_at <= ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(removed as u64)
    }

    async fn save_record(&self, record: &CallRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO tool_calls (id, session_id, tenant_id, tool_name, parameters_fingerprint,
                                    execution_status, error_type, error_message, is_redundant,
                                    original_call_id, redundant_reason, retry_count, recovered,
                                    recovery_strategy, duration_ms, input_tokens, output_tokens,
                                    created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(id) DO UPDATE SET
                execution_status = excluded.execution_status,
                error_type = excluded.error_type,
                error_message = excluded.error_message,
                is_redundant = excluded.is_redundant,
                original_call_id = excluded.original_call_id,
                redundant_reason = excluded.redundant_reason,
                retry_count = excluded.retry_count,
                recovered = excluded.recovered,
                recovery_strategy = excluded.recovery_strategy,
                duration_ms = excluded.duration_ms,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens,
                updated_at = excluded.updated_at
            "#,
            params![
                record.id,
                record.session_id,
                record.tenant_id,
                record.tool_name,
                record.parameters_fingerprint,
                record.execution_status.as_str(),
                record.error_type,
                record.error_message,
                record.is_redundant,
                record.original_call_id,
                record.redundant_reason,
                record.retry_count,
                record.recovered,
                record.recovery_strategy,
                opt_i64(record.duration_ms),
                opt_i64(record.input_tokens),
                opt_i64(record.output_tokens),
                record.created_at.timestamp_millis(),
                record.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn find_record_by_id(&self, id: &str) -> Result<Option<CallRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM tool_calls WHERE id = ?1", CALL_COLUMNS);
        let record = conn.query_row(&sql, params![id], call_from_row).optional()?;
        Ok(record)
    }

    async fn find_corrections_by_tool_call(
        &self,
        tool_call_id: &str,
    ) -> Result<Vec<CorrectionRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM corrections WHERE tool_call_id = ?1
             ORDER BY created_at ASC, correction_rounds ASC",
            CORRECTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![tool_call_id], correction_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn find_correction_by_id(&self, id: &str) -> Result<Option<CorrectionRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM corrections WHERE id = ?1", CORRECTION_COLUMNS);
        let record = conn.query_row(&sql, params![id], correction_from_row).optional()?;
        Ok(record)
    }

    async fn save_correction(&self, record: &CorrectionRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO corrections (id, tool_call_id, tenant_id, session_id, error_type,
                                     error_category, correction_strategy, correction_rounds,
                                     correction_success, final_status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                correction_success = excluded.correction_success,
                final_status = excluded.final_status
            "#,
            params![
                record.id,
                record.tool_call_id,
                record.tenant_id,
                record.session_id,
                record.error_type,
                record.error_category.as_str(),
                record.correction_strategy.as_str(),
                record.correction_rounds,
                record.correction_success,
                record.final_status,
                record.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn find_reflections(
        &self,
        tool_name: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<ReflectionMemory>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM reflections
             WHERE tool_name = ?1 AND (?2 IS NULL OR tenant_id = ?2)
             ORDER BY created_at DESC, rowid DESC",
            REFLECTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![tool_name, tenant_id], reflection_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn save_reflection(&self, entry: &ReflectionMemory) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reflections (id, tenant_id, tool_name, original_error, reflection_content,
                                      correction_strategy, was_successful, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id,
                entry.tenant_id,
                entry.tool_name,
                entry.original_error,
                entry.reflection_content,
                entry.correction_strategy.as_str(),
                entry.was_successful,
                entry.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }
}
