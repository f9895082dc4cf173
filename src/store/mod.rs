//! Storage Port
//!
//! Persistence boundary for call history, the result cache, correction rounds
//! and reflections. Implementations only promise single-row upsert atomicity;
//! read-then-write sequences built on top of this trait are not atomic.
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`] for tests and embedded use
//! - [`SqliteStore`] backed by rusqlite

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{CacheEntry, CallRecord, CorrectionRecord, ReflectionMemory};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage errors, passed through to callers untouched
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Persistence operations required by the guard components
#[async_trait]
pub trait GuardStore: Send + Sync {
    /// Cache entry for `key` if it has not expired at `now`
    async fn lookup_valid_cache(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, StoreError>;

    /// Most recent call with this session/tool/fingerprint created at or after `since`
    async fn find_recent_call(
        &self,
        session_id: &str,
        tool_name: &str,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CallRecord>, StoreError>;

    /// Insert or replace by cache key
    async fn save_cache(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Cache entry for `key`, expired or not
    async fn find_cache_by_key(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    async fn delete_cache_for_session(&self, session_id: &str) -> Result<u64, StoreError>;

    /// Remove entries with `expires_at <= now`
    async fn delete_expired_cache(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Insert or replace by record id
    async fn save_record(&self, record: &CallRecord) -> Result<(), StoreError>;

    async fn find_record_by_id(&self, id: &str) -> Result<Option<CallRecord>, StoreError>;

    /// All rounds for a tool call, oldest first
    async fn find_corrections_by_tool_call(
        &self,
        tool_call_id: &str,
    ) -> Result<Vec<CorrectionRecord>, StoreError>;

    async fn find_correction_by_id(&self, id: &str) -> Result<Option<CorrectionRecord>, StoreError>;

    /// Insert or replace by correction id
    async fn save_correction(&self, record: &CorrectionRecord) -> Result<(), StoreError>;

    /// Reflections for a tool, newest first; `tenant_id: None` spans all tenants
    async fn find_reflections(
        &self,
        tool_name: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<ReflectionMemory>, StoreError>;

    async fn save_reflection(&self, entry: &ReflectionMemory) -> Result<(), StoreError>;
}
