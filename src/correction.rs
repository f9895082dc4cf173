//! Correction State Machine
//!
//! Maps correction categories to strategies and tracks bounded correction
//! rounds per tool call:
//! - one `CorrectionRecord` row per round, the latest row is authoritative
//! - at most `MAX_ROUNDS` rounds per tool call
//! - counters saturate at zero, even over inconsistent data

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classifier::{classify_error, ErrorCategory};
use crate::store::{GuardStore, StoreError};
use crate::types::CorrectionRecord;

/// Maximum correction rounds per tool call
pub const MAX_ROUNDS: u32 = 3;

/// Corrective action for a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrectionStrategy {
    /// Fetch the data again, wider or from another source
    ReRetrieve,
    /// Redo the analysis step on the same data
    ReAnalyze,
    /// Reformat output / inputs to the expected shape
    FormatFix,
    /// Inject corrective guidance into the next prompt
    PromptInjection,
    /// Rerun the call from scratch
    FullRetry,
    /// Give up; only chosen by the reflective agent
    Abandon,
}

impl CorrectionStrategy {
    pub const ALL: [CorrectionStrategy; 6] = [
        Self::ReRetrieve,
        Self::ReAnalyze,
        Self::FormatFix,
        Self::PromptInjection,
        Self::FullRetry,
        Self::Abandon,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReRetrieve => "RE_RETRIEVE",
            Self::ReAnalyze => "RE_ANALYZE",
            Self::FormatFix => "FORMAT_FIX",
            Self::PromptInjection => "PROMPT_INJECTION",
            Self::FullRetry => "FULL_RETRY",
            Self::Abandon => "ABANDON",
        }
    }

    /// Parse a strategy name; dashes, spaces and case are ignored
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().replace(['-', ' '], "_").to_ascii_uppercase();
        Self::ALL.into_iter().find(|c| c.as_str() == normalized)
    }
}

impl fmt::Display for CorrectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy for a correction category
///
/// Never returns `Abandon`.
pub fn determine_strategy(category: Option<ErrorCategory>) -> CorrectionStrategy {
    match category {
        Some(ErrorCategory::DataInsufficient) => CorrectionStrategy::ReRetrieve,
        Some(ErrorCategory::AnalysisError) => CorrectionStrategy::ReAnalyze,
        Some(ErrorCategory::FormatError) => CorrectionStrategy::FormatFix,
        Some(ErrorCategory::LogicError) => CorrectionStrategy::PromptInjection,
        Some(ErrorCategory::Unknown) | None => CorrectionStrategy::FullRetry,
    }
}

/// Category-specific guidance for the next attempt
///
/// Always non-empty and always quotes `error_message`.
pub fn generate_correction_prompt(category: ErrorCategory, error_message: &str) -> String {
    let guidance = match category {
        ErrorCategory::DataInsufficient => {
            "The data retrieved so far is incomplete. Retrieve it again with broader \
             conditions or additional sources, and confirm every required field is present \
             before continuing."
        }
        ErrorCategory::FormatError => {
            "The output did not match the required format. Re-check the expected schema, \
             fix field names, types and structure, and return well-formed output only."
        }
        ErrorCategory::AnalysisError => {
            "The analysis produced an incorrect result. Re-examine the source data, redo \
             each calculation step by step, and verify the result against the inputs."
        }
        ErrorCategory::LogicError => {
            "The reasoning contains a contradiction. List the premises explicitly, remove \
             conclusions that conflict with them, and make sure each step follows from the \
             previous one."
        }
        ErrorCategory::Unknown => {
            "The previous attempt failed for an unclassified reason. Review the error, \
             adjust the approach, and retry the full operation."
        }
    };

    format!(
        "[{}] Previous attempt failed with error: \"{}\"\n{}",
        category.as_str(),
        error_message.trim(),
        guidance
    )
}

/// Correction round bookkeeping over the storage port
#[derive(Clone)]
pub struct CorrectionEngine {
    store: Arc<dyn GuardStore>,
}

impl CorrectionEngine {
    pub fn new(store: Arc<dyn GuardStore>) -> Self {
        Self { store }
    }

    /// Round count of the latest correction row, 0 when none exist
    pub async fn current_round(&self, tool_call_id: &str) -> Result<u32, StoreError> {
        let rows = self.store.find_corrections_by_tool_call(tool_call_id).await?;
        Ok(rows.last().map_or(0, |r| r.correction_rounds))
    }

    /// Classify the failure and persist the next correction round
    pub async fn create_correction_record(
        &self,
        tool_call_id: &str,
        tenant_id: Option<&str>,
        session_id: Option<&str>,
        error_type: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<CorrectionRecord, StoreError> {
        let category = classify_error(error_message, error_type);
        let strategy = determine_strategy(Some(category));

        let existing = self.store.find_corrections_by_tool_call(tool_call_id).await?;
        let previous = existing.iter().map(|r| r.correction_rounds).max().unwrap_or(0);

        let record = CorrectionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            tool_call_id: tool_call_id.to_string(),
            tenant_id: tenant_id.map(str::to_string),
            session_id: session_id.map(str::to_string),
            error_type: error_type.map(str::to_string),
            error_category: category,
            correction_strategy: strategy,
            correction_rounds: previous.saturating_add(1),
            correction_success: false,
            final_status: None,
            created_at: Utc::now(),
        };

        self.store.save_correction(&record).await?;

        info!(
            "Correction round {} for call {}: category={}, strategy={}",
            record.correction_rounds, tool_call_id, category, strategy
        );
        Ok(record)
    }

    /// True while the latest round is below `MAX_ROUNDS`
    pub async fn should_retry(&self, tool_call_id: &str) -> Result<bool, StoreError> {
        let round = self.current_round(tool_call_id).await?;
        let allowed = round < MAX_ROUNDS;
        debug!("Call {} at round {}: retry allowed={}", tool_call_id, round, allowed);
        Ok(allowed)
    }

    pub async fn get_remaining_retries(&self, tool_call_id: &str) -> Result<u32, StoreError> {
        let round = self.current_round(tool_call_id).await?;
        Ok(MAX_ROUNDS.saturating_sub(round))
    }

    /// Record the outcome of a correction round
    ///
    /// Later calls overwrite earlier outcomes. Returns false when the record
    /// does not exist.
    pub async fn record_correction_outcome(
        &self,
        record_id: &str,
        success: bool,
        final_status: &str,
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.store.find_correction_by_id(record_id).await? else {
            debug!("Correction {} not found, outcome dropped", record_id);
            return Ok(false);
        };

        if let Some(previous) = &record.final_status {
            warn!(
                "Overwriting outcome of correction {}: '{}' -> '{}'",
                record_id, previous, final_status
            );
        }

        record.correction_success = success;
        record.final_status = Some(final_status.to_string());
        self.store.save_correction(&record).await?;
        Ok(true)
    }
}
