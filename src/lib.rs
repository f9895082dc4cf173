//! toolguard
//!
//! Reliability layer for tool calls made by LLM-driven agents.
//!
//! # Features
//!
//! - **Redundancy Detection**: Canonical SHA256 parameter fingerprints + per-session TTL cache
//! - **Failure Classification**: Keyword taxonomies for correction and recovery
//! - **Bounded Correction**: Strategy selection with at most 3 correction rounds per call
//! - **Reflective Correction**: LLM-proposed parameter fixes gated by confidence and pre-checks
//! - **Recovery Advice**: Hints, alternative tools and parameter fixes for failed calls
//!
//! # Architecture
//!
//! ```text
//! Agent ──► is_redundant? ──► execute tool ──► failed? ──► classify_error
//!               │                                            │
//!               ├── Cache (session:tool:fingerprint)         ├── CorrectionEngine (≤ 3 rounds)
//!               └── History (lookback window)                ├── ReflectiveCorrector (Claude)
//!                                                            └── RecoveryAdvisor
//!                         all state ──► GuardStore (Memory / SQLite)
//! ```

pub mod classifier;
pub mod config;
pub mod correction;
pub mod fingerprint;
pub mod llm;
pub mod recovery;
pub mod redundancy;
pub mod reflection;
pub mod store;
pub mod types;

use std::sync::Arc;

pub use classifier::{classify_error, classify_recovery, ErrorCategory, RecoveryCategory};
pub use config::GuardConfig;
pub use correction::{determine_strategy, generate_correction_prompt, CorrectionEngine, CorrectionStrategy, MAX_ROUNDS};
pub use fingerprint::{fingerprint, fingerprint_json, ParamValue};
pub use llm::{ClaudeClient, CompletionClient, CompletionReply, CompletionRequest, LlmError};
pub use recovery::{suggest_parameter_fixes, ParameterFix, RecoveryAdvisor, RecoveryPlan};
pub use redundancy::RedundancyDetector;
pub use reflection::{CorrectionDecision, ReflectionRequest, ReflectiveCorrector, VerificationResult};
pub use store::{GuardStore, MemoryStore, SqliteStore, StoreError};
pub use types::{CacheEntry, CallRecord, CorrectionRecord, ExecutionStatus, NewToolCall, ReflectionMemory};

/// All guard components over one shared store
#[derive(Clone)]
pub struct ToolGuard {
    pub redundancy: RedundancyDetector,
    pub corrections: CorrectionEngine,
    pub recovery: RecoveryAdvisor,
    /// Present only when a completion client is configured
    pub reflection: Option<ReflectiveCorrector>,
}

impl ToolGuard {
    pub fn new(store: Arc<dyn GuardStore>, config: &GuardConfig) -> Self {
        Self {
            redundancy: RedundancyDetector::new(store.clone(), config),
            corrections: CorrectionEngine::new(store.clone()),
            recovery: RecoveryAdvisor::new(store),
            reflection: None,
        }
    }

    /// Enable reflective correction with the given completion client
    pub fn with_reflection(
        mut self,
        store: Arc<dyn GuardStore>,
        client: Arc<dyn CompletionClient>,
        config: &GuardConfig,
    ) -> Self {
        self.reflection = Some(ReflectiveCorrector::new(store, client, config));
        self
    }

    /// SQLite-backed guard; reflection is enabled when an API key is set
    pub fn open(config: &GuardConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn GuardStore> = Arc::new(SqliteStore::open(&config.db_path)?);
        let guard = Self::new(store.clone(), config);

        let claude = ClaudeClient::from_config(config);
        if claude.is_available() {
            Ok(guard.with_reflection(store, Arc::new(claude), config))
        } else {
            Ok(guard)
        }
    }
}
