//! Redundancy Detection
//!
//! Decides whether a tool call repeats a recent successful one, and manages
//! the per-session result cache plus the call-record lifecycle.
//!
//! Decision order for `is_redundant`:
//! 1. any identifier missing → not redundant (fail open)
//! 2. valid cache entry for `session:tool:fingerprint` → redundant
//! 3. most recent identical call inside the lookback window:
//!    SUCCESS → redundant; FAILED, TIMEOUT, SKIPPED → not redundant
//!
//! Check-then-write is not atomic: concurrent writers on one key race and the
//! last write wins.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::GuardConfig;
use crate::fingerprint::fingerprint_json;
use crate::store::{GuardStore, StoreError};
use crate::types::{expiry_after, minutes_saturating, CacheEntry, CallRecord, ExecutionStatus, NewToolCall};

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn short(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Redundancy detector and result cache
#[derive(Clone)]
pub struct RedundancyDetector {
    store: Arc<dyn GuardStore>,
    lookback: Duration,
    default_ttl_minutes: i64,
}

impl RedundancyDetector {
    pub fn new(store: Arc<dyn GuardStore>, config: &GuardConfig) -> Self {
        Self {
            store,
            lookback: minutes_saturating(config.lookback_minutes),
            default_ttl_minutes: config.cache_ttl_minutes,
        }
    }

    /// Override the lookback window
    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    /// Check whether this call duplicates a recent successful one
    pub async fn is_redundant(
        &self,
        session_id: Option<&str>,
        tool_name: Option<&str>,
        params: Option<&Value>,
    ) -> Result<bool, StoreError> {
        let (Some(session_id), Some(tool_name), Some(params)) =
            (present(session_id), present(tool_name), params)
        else {
            debug!("Redundancy check skipped: missing session, tool or params");
            return Ok(false);
        };

        let fingerprint = fingerprint_json(Some(params));
        let key = CacheEntry::key(session_id, tool_name, &fingerprint);
        let now = Utc::now();

        if self.store.lookup_valid_cache(&key, now).await?.is_some() {
            debug!("Redundant call (cache): {} {}", tool_name, short(&fingerprint, 16));
            return Ok(true);
        }

        let since = now
            .checked_sub_signed(self.lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let Some(prior) = self
            .store
            .find_recent_call(session_id, tool_name, &fingerprint, since)
            .await?
        else {
            return Ok(false);
        };

        let redundant = match prior.execution_status {
            ExecutionStatus::Success => true,
            // Failures must not suppress a legitimate retry, and a skipped
            // call is never the original of a new chain
            ExecutionStatus::Failed | ExecutionStatus::Timeout | ExecutionStatus::Skipped => false,
        };

        debug!(
            "Prior call {} for {} is {}: redundant={}",
            prior.id, tool_name, prior.execution_status, redundant
        );
        Ok(redundant)
    }

    /// Store a tool result
    ///
    /// Overwrites payload, origin and expiry of an existing entry. A TTL of
    /// zero or less writes an entry that is already stale.
    pub async fn cache_result(
        &self,
        session_id: &str,
        tool_name: &str,
        params: Option<&Value>,
        payload: Value,
        originating_call_id: Option<&str>,
        ttl_minutes: Option<i64>,
    ) -> Result<CacheEntry, StoreError> {
        let ttl_minutes = ttl_minutes.unwrap_or(self.default_ttl_minutes);
        let fingerprint = fingerprint_json(params);
        let key = CacheEntry::key(session_id, tool_name, &fingerprint);

        let entry = match self.store.find_cache_by_key(&key).await? {
            Some(mut existing) => {
                existing.cached_payload = payload;
                existing.originating_call_id = originating_call_id.map(str::to_string);
                existing.expires_at = expiry_after(Utc::now(), ttl_minutes);
                existing
            }
            None => CacheEntry::new(
                session_id,
                tool_name,
                &fingerprint,
                payload,
                originating_call_id,
                ttl_minutes,
            ),
        };

        self.store.save_cache(&entry).await?;
        debug!("Cache SET: {} (ttl {}m)", short(&key, 48), ttl_minutes);
        Ok(entry)
    }

    /// Cached payload for this call, counting the hit
    pub async fn get_cached_result(
        &self,
        session_id: &str,
        tool_name: &str,
        params: Option<&Value>,
    ) -> Result<Option<Value>, StoreError> {
        let key = CacheEntry::key(session_id, tool_name, &fingerprint_json(params));

        let Some(mut entry) = self.store.lookup_valid_cache(&key, Utc::now()).await? else {
            debug!("Cache MISS: {} {}", session_id, tool_name);
            return Ok(None);
        };

        entry.hit_count = entry.hit_count.saturating_add(1);
        self.store.save_cache(&entry).await?;

        debug!("Cache HIT: {} {} (hits={})", session_id, tool_name, entry.hit_count);
        Ok(Some(entry.cached_payload))
    }

    /// Remove every expired cache entry
    pub async fn cleanup_expired_cache(&self) -> Result<u64, StoreError> {
        let removed = self.store.delete_expired_cache(Utc::now()).await?;
        if removed > 0 {
            info!("Removed {} expired cache entries", removed);
        }
        Ok(removed)
    }

    /// Remove all cache entries of one session
    pub async fn clear_session_cache(&self, session_id: &str) -> Result<u64, StoreError> {
        let removed = self.store.delete_cache_for_session(session_id).await?;
        debug!("Cleared {} cache entries for session {}", removed, session_id);
        Ok(removed)
    }

    /// Persist a new call record
    pub async fn record_tool_call(&self, call: NewToolCall) -> Result<CallRecord, StoreError> {
        let fingerprint = fingerprint_json(call.parameters.as_ref());

        let mut record = CallRecord::new(&call.session_id, &call.tool_name, &fingerprint, call.status);
        record.tenant_id = call.tenant_id;
        record.error_type = call.error_type;
        record.error_message = call.error_message;
        record.duration_ms = call.duration_ms;
        record.input_tokens = call.input_tokens;
        record.output_tokens = call.output_tokens;

        self.store.save_record(&record).await?;
        debug!("Recorded call {} ({} {})", record.id, record.tool_name, record.execution_status);
        Ok(record)
    }

    /// Mark a call as a duplicate of `original_call_id`
    ///
    /// Unknown record ids are ignored; returns whether a record was updated.
    pub async fn mark_as_redundant(
        &self,
        record_id: &str,
        original_call_id: &str,
        reason: &str,
    ) -> Result<bool, StoreError> {
        self.update_record(record_id, |record| {
            record.execution_status = ExecutionStatus::Skipped;
            record.is_redundant = true;
            record.original_call_id = Some(original_call_id.to_string());
            record.redundant_reason = Some(reason.to_string());
        })
        .await
    }

    /// Record a failed or timed-out execution
    pub async fn record_failure(
        &self,
        record_id: &str,
        status: ExecutionStatus,
        error_type: Option<&str>,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        self.update_record(record_id, |record| {
            record.execution_status = status;
            record.error_type = error_type.map(str::to_string);
            record.error_message = Some(error_message.to_string());
        })
        .await
    }

    /// Record that a failed call succeeded after correction
    pub async fn record_recovery(&self, record_id: &str, strategy: &str) -> Result<bool, StoreError> {
        self.update_record(record_id, |record| {
            record.execution_status = ExecutionStatus::Success;
            record.recovered = true;
            record.recovery_strategy = Some(strategy.to_string());
        })
        .await
    }

    /// Bump the retry counter, returning the new value
    pub async fn increment_retry_count(&self, record_id: &str) -> Result<Option<u32>, StoreError> {
        let mut updated = None;
        self.update_record(record_id, |record| {
            record.retry_count = record.retry_count.saturating_add(1);
            updated = Some(record.retry_count);
        })
        .await?;
        Ok(updated)
    }

    async fn update_record<F>(&self, record_id: &str, apply: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut CallRecord),
    {
        let Some(mut record) = self.store.find_record_by_id(record_id).await? else {
            debug!("Call record {} not found, update ignored", record_id);
            return Ok(false);
        };

        apply(&mut record);
        record.updated_at = Utc::now();
        self.store.save_record(&record).await?;
        Ok(true)
    }
}
