//! Persistent Records
//!
//! Plain value types exchanged with the storage port.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::classifier::ErrorCategory;
use crate::correction::CorrectionStrategy;

/// Outcome of a single tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
    /// Not executed because it duplicated an earlier call
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "TIMEOUT" => Some(Self::Timeout),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tool-invocation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub session_id: String,
    pub tenant_id: Option<String>,
    pub tool_name: String,
    pub parameters_fingerprint: String,
    pub execution_status: ExecutionStatus,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub is_redundant: bool,
    /// Call this one duplicates; only set when `is_redundant`
    pub original_call_id: Option<String>,
    pub redundant_reason: Option<String>,
    pub retry_count: u32,
    pub recovered: bool,
    pub recovery_strategy: Option<String>,
    pub duration_ms: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn new(
        session_id: &str,
        tool_name: &str,
        parameters_fingerprint: &str,
        execution_status: ExecutionStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tenant_id: None,
            tool_name: tool_name.to_string(),
            parameters_fingerprint: parameters_fingerprint.to_string(),
            execution_status,
            error_type: None,
            error_message: None,
            is_redundant: false,
            original_call_id: None,
            redundant_reason: None,
            retry_count: 0,
            recovered: false,
            recovery_strategy: None,
            duration_ms: None,
            input_tokens: None,
            output_tokens: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input for recording a new tool call
#[derive(Debug, Clone)]
pub struct NewToolCall {
    pub session_id: String,
    pub tenant_id: Option<String>,
    pub tool_name: String,
    pub parameters: Option<Value>,
    pub status: ExecutionStatus,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl NewToolCall {
    pub fn new(session_id: &str, tool_name: &str, parameters: Option<Value>, status: ExecutionStatus) -> Self {
        Self {
            session_id: session_id.to_string(),
            tenant_id: None,
            tool_name: tool_name.to_string(),
            parameters,
            status,
            error_type: None,
            error_message: None,
            duration_ms: None,
            input_tokens: None,
            output_tokens: None,
        }
    }

    pub fn tenant(mut self, tenant_id: &str) -> Self {
        self.tenant_id = Some(tenant_id.to_string());
        self
    }

    pub fn error(mut self, error_type: Option<&str>, message: &str) -> Self {
        self.error_type = error_type.map(str::to_string);
        self.error_message = Some(message.to_string());
        self
    }

    pub fn timing(mut self, duration_ms: u64, input_tokens: u64, output_tokens: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self.input_tokens = Some(input_tokens);
        self.output_tokens = Some(output_tokens);
        self
    }
}

/// Cached tool result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub session_id: String,
    pub tool_name: String,
    pub fingerprint: String,
    pub cached_payload: Value,
    pub originating_call_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
}

/// `minutes` as a delta, saturating at the representable bounds
pub fn minutes_saturating(minutes: i64) -> Duration {
    Duration::try_minutes(minutes).unwrap_or(if minutes < 0 { Duration::MIN } else { Duration::MAX })
}

/// `now + ttl_minutes`, clamped to the representable date range
pub fn expiry_after(now: DateTime<Utc>, ttl_minutes: i64) -> DateTime<Utc> {
    now.checked_add_signed(minutes_saturating(ttl_minutes))
        .unwrap_or(if ttl_minutes < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

fn escape_key_part(part: &str) -> String {
    part.replace('\\', "\\\\").replace(':', "\\:")
}

impl CacheEntry {
    /// Key = session:tool:fingerprint
    ///
    /// `\` and `:` inside session and tool ids are backslash-escaped, so
    /// distinct (session, tool) pairs never share a key.
    pub fn key(session_id: &str, tool_name: &str, fingerprint: &str) -> String {
        format!(
            "{}:{}:{}",
            escape_key_part(session_id),
            escape_key_part(tool_name),
            fingerprint
        )
    }

    /// Entry with `expires_at = now + ttl_minutes`
    pub fn new(
        session_id: &str,
        tool_name: &str,
        fingerprint: &str,
        payload: Value,
        originating_call_id: Option<&str>,
        ttl_minutes: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            cache_key: Self::key(session_id, tool_name, fingerprint),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            fingerprint: fingerprint.to_string(),
            cached_payload: payload,
            originating_call_id: originating_call_id.map(str::to_string),
            expires_at: expiry_after(now, ttl_minutes),
            hit_count: 0,
            created_at: now,
        }
    }

    /// Still valid at `now` (expiry is exclusive)
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// One round of a correction lineage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub id: String,
    pub tool_call_id: String,
    pub tenant_id: Option<String>,
    pub session_id: Option<String>,
    pub error_type: Option<String>,
    pub error_category: ErrorCategory,
    pub correction_strategy: CorrectionStrategy,
    pub correction_rounds: u32,
    pub correction_success: bool,
    pub final_status: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only log of a past correction attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionMemory {
    pub id: String,
    pub tenant_id: Option<String>,
    pub tool_name: String,
    pub original_error: String,
    pub reflection_content: String,
    pub correction_strategy: CorrectionStrategy,
    pub was_successful: bool,
    pub created_at: DateTime<Utc>,
}

impl ReflectionMemory {
    pub fn new(
        tenant_id: Option<&str>,
        tool_name: &str,
        original_error: &str,
        reflection_content: &str,
        correction_strategy: CorrectionStrategy,
        was_successful: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.map(str::to_string),
            tool_name: tool_name.to_string(),
            original_error: original_error.to_string(),
            reflection_content: reflection_content.to_string(),
            correction_strategy,
            was_successful,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_parse() {
        assert_eq!(ExecutionStatus::parse("success"), Some(ExecutionStatus::Success));
        assert_eq!(ExecutionStatus::parse("TIMEOUT"), Some(ExecutionStatus::Timeout));
        assert_eq!(ExecutionStatus::parse("done"), None);
        assert_eq!(ExecutionStatus::Skipped.to_string(), "SKIPPED");
    }

    #[test]
    fn test_cache_key_format() {
        assert_eq!(CacheEntry::key("s1", "search", "abc"), "s1:search:abc");
    }

    #[test]
    fn test_cache_key_escapes_separators() {
        let a = CacheEntry::key("s1:search", "x", "fp");
        let b = CacheEntry::key("s1", "search:x", "fp");
        assert_ne!(a, b);
        assert_eq!(a, "s1\\:search:x:fp");
        assert_ne!(CacheEntry::key("s\\", ":t", "fp"), CacheEntry::key("s\\:", "t", "fp"));
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, i64::MAX / 2), DateTime::<Utc>::MAX_UTC);
        assert_eq!(expiry_after(now, i64::MIN), DateTime::<Utc>::MIN_UTC);
        assert_eq!(expiry_after(now, 5), now + Duration::minutes(5));

        let entry = CacheEntry::new("s", "t", "fp", json!(1), None, i64::MAX / 2);
        assert!(entry.is_valid_at(now));
    }

    #[test]
    fn test_cache_entry_ttl() {
        let live = CacheEntry::new("s1", "search", "abc", json!({"ok": true}), None, 5);
        assert!(live.is_valid_at(Utc::now()));

        let stale = CacheEntry::new("s1", "search", "abc", json!({"ok": true}), None, 0);
        assert!(stale.expires_at <= Utc::now());
        assert!(!stale.is_valid_at(Utc::now()));
    }

    #[test]
    fn test_record_serializes_status_uppercase() {
        let record = CallRecord::new("s1", "search", "abc", ExecutionStatus::Failed);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["execution_status"], "FAILED");
    }
}
