//! Error Recovery Advisor
//!
//! Works on the recovery taxonomy: decides whether a failed call is worth
//! another attempt and assembles a plan with hints, alternative tools and
//! parameter fixes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::classifier::{classify_recovery, RecoveryCategory};
use crate::store::{GuardStore, StoreError};
use crate::types::CallRecord;

/// Retries allowed per call record
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

static RE_NAMED_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:field|parameter|param|argument|property)s?\s*[:=]?\s*['"`]?([A-Za-z_][A-Za-z0-9_.]*)['"`]?"#)
        .expect("named field regex")
});

static RE_QUOTED_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"['"`]([A-Za-z_][A-Za-z0-9_.]*)['"`]\s+(?:is|was|are)?\s*(?:required|missing|invalid|must|should|cannot|not allowed)"#)
        .expect("quoted field regex")
});

static RE_CN_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"参数\s*[「“"'`]?([A-Za-z_][A-Za-z0-9_.]*)"#).expect("chinese field regex")
});

static RE_DATE_MENTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:date|datetime|timestamp|iso ?8601)\b|日期|时间格式").expect("date regex")
});

const NOT_A_FIELD: &[&str] = &[
    "is", "was", "are", "must", "should", "not", "the", "a", "an", "value", "required", "missing",
    "invalid", "error", "format",
];

/// Suggested change to one parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterFix {
    pub field: String,
    pub issue: String,
    pub suggestion: String,
}

/// Outcome of `quick_recover`
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryPlan {
    pub record_id: String,
    pub category: RecoveryCategory,
    pub should_retry: bool,
    pub hint: String,
    pub alternatives: Vec<String>,
    pub parameter_fixes: Vec<ParameterFix>,
    /// Retry count after this plan (incremented when a retry was approved)
    pub retry_count: u32,
}

/// Recovery advisor over the storage port
#[derive(Clone)]
pub struct RecoveryAdvisor {
    store: Arc<dyn GuardStore>,
    alternatives: HashMap<String, Vec<String>>,
}

impl RecoveryAdvisor {
    pub fn new(store: Arc<dyn GuardStore>) -> Self {
        Self {
            store,
            alternatives: HashMap::new(),
        }
    }

    /// Register fallback tools for `tool_name`
    pub fn with_alternatives<I, S>(mut self, tool_name: &str, alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alternatives
            .entry(tool_name.to_string())
            .or_default()
            .extend(alternatives.into_iter().map(Into::into));
        self
    }

    /// Whether the failed call behind `record_id` should be retried
    pub async fn should_attempt_recovery(&self, record_id: &str) -> Result<bool, StoreError> {
        let Some(record) = self.store.find_record_by_id(record_id).await? else {
            debug!("Recovery check: record {} not found", record_id);
            return Ok(false);
        };
        let category = categorize(&record);
        Ok(retry_allowed(&record, category))
    }

    /// Fallback tools worth trying for this failure
    ///
    /// Only offered when the service or data may be reachable another way.
    pub fn suggest_alternative_tools(&self, tool_name: &str, category: RecoveryCategory) -> Vec<String> {
        match category {
            RecoveryCategory::ServiceUnavailable
            | RecoveryCategory::DataNotFound
            | RecoveryCategory::Unknown => self
                .alternatives
                .get(tool_name)
                .map(|alts| alts.iter().filter(|alt| alt.as_str() != tool_name).cloned().collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Assemble a recovery plan for a failed call
    ///
    /// Records store only the parameter fingerprint, so the original params
    /// are passed in for fix suggestions.
    pub async fn quick_recover(
        &self,
        record_id: &str,
        params: Option<&Value>,
    ) -> Result<Option<RecoveryPlan>, StoreError> {
        let Some(mut record) = self.store.find_record_by_id(record_id).await? else {
            debug!("Quick recover: record {} not found", record_id);
            return Ok(None);
        };

        let category = categorize(&record);
        let should_retry = retry_allowed(&record, category);
        let error_message = record.error_message.clone().unwrap_or_default();

        if should_retry {
            record.retry_count = record.retry_count.saturating_add(1);
            record.updated_at = chrono::Utc::now();
            self.store.save_record(&record).await?;
        }

        let plan = RecoveryPlan {
            record_id: record.id.clone(),
            category,
            should_retry,
            hint: category.hint().to_string(),
            alternatives: self.suggest_alternative_tools(&record.tool_name, category),
            parameter_fixes: suggest_parameter_fixes(params, &error_message),
            retry_count: record.retry_count,
        };

        info!(
            "Recovery plan for {} ({}): category={}, retry={}, attempt {}/{}",
            record.tool_name,
            record.id,
            category.as_str(),
            should_retry,
            plan.retry_count,
            MAX_RETRY_ATTEMPTS
        );
        Ok(Some(plan))
    }
}

fn categorize(record: &CallRecord) -> RecoveryCategory {
    classify_recovery(record.error_message.as_deref(), record.error_type.as_deref())
}

fn retry_allowed(record: &CallRecord, category: RecoveryCategory) -> bool {
    record.retry_count < MAX_RETRY_ATTEMPTS && category.is_recoverable()
}

/// Parameter fixes derived from the error text and the params themselves
///
/// De-duplicated by field; the first suggestion for a field wins.
pub fn suggest_parameter_fixes(params: Option<&Value>, error_message: &str) -> Vec<ParameterFix> {
    let mut fixes = Vec::new();
    let lower = error_message.to_lowercase();

    for field in fields_named_in(error_message) {
        let (issue, suggestion) = if lower.contains("required")
            || lower.contains("missing")
            || error_message.contains("缺少")
        {
            ("missing value", format!("Provide a value for '{}'", field))
        } else if lower.contains("format") || error_message.contains("格式") {
            ("bad format", format!("Check the format of '{}'", field))
        } else {
            ("rejected by tool", format!("Verify the value of '{}'", field))
        };
        fixes.push(ParameterFix {
            field,
            issue: issue.to_string(),
            suggestion,
        });
    }

    if let Some(Value::Object(map)) = params {
        for (key, value) in map {
            let issue = match value {
                Value::Null => "null value",
                Value::String(s) if s.trim().is_empty() => "blank value",
                _ => continue,
            };
            fixes.push(ParameterFix {
                field: key.clone(),
                issue: issue.to_string(),
                suggestion: format!("Provide a non-empty value for '{}'", key),
            });
        }
    }

    if RE_DATE_MENTION.is_match(error_message) {
        let date_fields: Vec<String> = match params {
            Some(Value::Object(map)) => map
                .keys()
                .filter(|k| {
                    let k = k.to_lowercase();
                    k.contains("date") || k.contains("time")
                })
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        let date_fields = if date_fields.is_empty() {
            vec!["date".to_string()]
        } else {
            date_fields
        };
        for field in date_fields {
            fixes.push(ParameterFix {
                suggestion: format!("Use ISO 8601 (YYYY-MM-DD) for '{}'", field),
                field,
                issue: "date format".to_string(),
            });
        }
    }

    let mut seen = HashSet::new();
    fixes.retain(|fix| seen.insert(fix.field.clone()));
    fixes
}

fn fields_named_in(error_message: &str) -> Vec<String> {
    let mut fields = Vec::new();
    for re in [&*RE_NAMED_FIELD, &*RE_QUOTED_FIELD, &*RE_CN_FIELD] {
        for caps in re.captures_iter(error_message) {
            if let Some(m) = caps.get(1) {
                let name = m.as_str().trim_end_matches('.');
                if !name.is_empty()
                    && !NOT_A_FIELD.contains(&name.to_lowercase().as_str())
                    && !fields.iter().any(|f| f == name)
                {
                    fields.push(name.to_string());
                }
            }
        }
    }
    fields
}
