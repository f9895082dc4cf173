//! Reflective Correction Agent
//!
//! Asks a language model to explain a failed tool call and propose corrected
//! parameters, using past reflections for the same tool as context. Every
//! attempt is appended to the reflection log whether or not it produced a
//! usable correction.
//!
//! The model only proposes; retries are gated locally:
//! - completion failures, error payloads and unparseable replies never retry
//! - confidence below the threshold never retries
//! - an `ABANDON` strategy never retries
//! - the pre-check (`should_retry`) can veto any proposal

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::correction::CorrectionStrategy;
use crate::llm::{ChatMessage, CompletionClient, CompletionReply, CompletionRequest};
use crate::store::{GuardStore, StoreError};
use crate::types::ReflectionMemory;

/// Attempts after which the pre-check refuses to retry
pub const MAX_RETRIES: u32 = 3;

/// Default confidence below which proposals are not retried
pub const MIN_CONFIDENCE: f64 = 0.30;

/// Rendered history when a tool has no reflections yet
pub const NO_HISTORICAL_REFLECTIONS: &str = "No historical reflections for this tool.";

const MAX_TOKENS: usize = 1024;

static RE_PERMISSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)permission|unauthori[sz]ed|forbidden|access denied|credential|api[ _-]?key|invalid token|authenticat|\b401\b|\b403\b|权限|未授权|凭证|认证失败",
    )
    .expect("permission regex")
});

const SYSTEM_PROMPT: &str = "You review failed tool calls made by an AI agent. \
Explain why the call failed and decide whether a corrected call could succeed. \
Answer with a single JSON object and nothing else.";

/// Post-execution check of a tool result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    /// The tool ran but returned no data; a retry will not change that
    pub data_empty: bool,
    pub diagnostics: Vec<String>,
}

/// Input to `analyze_and_correct`
#[derive(Debug, Clone)]
pub struct ReflectionRequest {
    pub tenant_id: Option<String>,
    pub user_intent: String,
    pub tool_name: String,
    pub original_params: Value,
    pub error_message: String,
    pub verification: Option<VerificationResult>,
    /// Attempts already made, starting at 0
    pub attempt_number: u32,
}

/// Retry decision produced by the agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrectionDecision {
    pub should_retry: bool,
    pub strategy: CorrectionStrategy,
    pub corrected_params: Option<Value>,
    pub reflection: String,
    pub confidence: f64,
}

impl CorrectionDecision {
    fn unusable(reason: String) -> Self {
        Self {
            should_retry: false,
            strategy: CorrectionStrategy::Abandon,
            corrected_params: None,
            reflection: format!("Reflection unavailable: {}", reason),
            confidence: 0.0,
        }
    }
}

/// Reply payload; accepts camelCase and snake_case keys
#[derive(Debug, Deserialize)]
struct ReflectionPayload {
    #[serde(default, alias = "shouldRetry")]
    should_retry: Option<bool>,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default, alias = "correctedParams")]
    corrected_params: Option<Value>,
    #[serde(default)]
    reflection: Option<String>,
    #[serde(default)]
    confidence: Option<Value>,
}

/// LLM-assisted correction agent
#[derive(Clone)]
pub struct ReflectiveCorrector {
    store: Arc<dyn GuardStore>,
    client: Arc<dyn CompletionClient>,
    model: String,
    history_limit: usize,
    min_confidence: f64,
}

impl ReflectiveCorrector {
    pub fn new(
        store: Arc<dyn GuardStore>,
        client: Arc<dyn CompletionClient>,
        config: &GuardConfig,
    ) -> Self {
        Self {
            store,
            client,
            model: config.model.clone(),
            history_limit: config.history_limit,
            min_confidence: config.confidence_threshold,
        }
    }

    /// Reflect on a failure and decide whether to retry with corrections
    ///
    /// Only storage failures are returned as errors; a failed completion
    /// yields a non-retry decision.
    pub async fn analyze_and_correct(
        &self,
        request: &ReflectionRequest,
    ) -> Result<CorrectionDecision, StoreError> {
        let history = self
            .get_historical_reflections(
                request.tenant_id.as_deref(),
                &request.tool_name,
                self.history_limit,
            )
            .await?;

        let completion = self
            .client
            .complete(CompletionRequest {
                model: self.model.clone(),
                messages: vec![
                    ChatMessage::system(SYSTEM_PROMPT),
                    ChatMessage::user(build_prompt(request, &history)),
                ],
                max_tokens: MAX_TOKENS,
            })
            .await;

        let mut decision = match completion {
            Ok(CompletionReply::Text(text)) if !text.trim().is_empty() => match parse_decision(&text) {
                Some(decision) => decision,
                None => {
                    warn!("Unparseable reflection reply for {}", request.tool_name);
                    CorrectionDecision::unusable(format!("unparseable reply: {}", truncate(&text, 200)))
                }
            },
            Ok(CompletionReply::Text(_)) => {
                warn!("Empty reflection reply for {}", request.tool_name);
                CorrectionDecision::unusable("empty reply".to_string())
            }
            Ok(CompletionReply::Error(payload)) => {
                warn!("Completion error payload for {}: {}", request.tool_name, payload);
                CorrectionDecision::unusable(payload)
            }
            Err(e) => {
                warn!("Completion failed for {}: {}", request.tool_name, e);
                CorrectionDecision::unusable(e.to_string())
            }
        };

        if decision.confidence < self.min_confidence {
            debug!(
                "Confidence {:.2} below {:.2}, not retrying",
                decision.confidence, self.min_confidence
            );
            decision.should_retry = false;
        }
        if decision.strategy == CorrectionStrategy::Abandon {
            decision.should_retry = false;
        }
        if !self.should_retry(
            &request.error_message,
            request.verification.as_ref(),
            request.attempt_number,
        ) {
            decision.should_retry = false;
        }

        let memory = ReflectionMemory::new(
            request.tenant_id.as_deref(),
            &request.tool_name,
            &request.error_message,
            &decision.reflection,
            decision.strategy,
            decision.should_retry,
        );
        self.store.save_reflection(&memory).await?;

        info!(
            "Reflection for {} (attempt {}): strategy={}, confidence={:.2}, retry={}",
            request.tool_name,
            request.attempt_number,
            decision.strategy,
            decision.confidence,
            decision.should_retry
        );

        Ok(decision)
    }

    /// Pre-check independent of the model's proposal
    pub fn should_retry(
        &self,
        error_message: &str,
        verification: Option<&VerificationResult>,
        attempt_number: u32,
    ) -> bool {
        if attempt_number >= MAX_RETRIES {
            debug!("Retry vetoed: attempt {} reached limit {}", attempt_number, MAX_RETRIES);
            return false;
        }
        if RE_PERMISSION.is_match(error_message) {
            debug!("Retry vetoed: permission or credential failure");
            return false;
        }
        if verification.is_some_and(|v| v.data_empty) {
            debug!("Retry vetoed: verification reports empty data");
            return false;
        }
        true
    }

    /// Most recent reflections for a tool, one annotated line each
    pub async fn get_historical_reflections(
        &self,
        tenant_id: Option<&str>,
        tool_name: &str,
        limit: usize,
    ) -> Result<String, StoreError> {
        let rows = self.store.find_reflections(tool_name, tenant_id).await?;
        if rows.is_empty() || limit == 0 {
            return Ok(NO_HISTORICAL_REFLECTIONS.to_string());
        }

        let lines: Vec<String> = rows
            .iter()
            .take(limit)
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "{}. [{}] strategy={} error=\"{}\" reflection=\"{}\"",
                    i + 1,
                    if r.was_successful { "SUCCESS" } else { "FAILURE" },
                    r.correction_strategy,
                    truncate(&r.original_error, 200),
                    truncate(&r.reflection_content, 300)
                )
            })
            .collect();

        Ok(lines.join("\n"))
    }
}

fn build_prompt(request: &ReflectionRequest, history: &str) -> String {
    let params = serde_json::to_string_pretty(&request.original_params)
        .unwrap_or_else(|_| request.original_params.to_string());

    let verification = match &request.verification {
        Some(v) if v.diagnostics.is_empty() => {
            format!("passed={}, data_empty={}", v.passed, v.data_empty)
        }
        Some(v) => format!(
            "passed={}, data_empty={}\n- {}",
            v.passed,
            v.data_empty,
            v.diagnostics.join("\n- ")
        ),
        None => "none".to_string(),
    };

    let strategies = CorrectionStrategy::ALL
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"A tool call failed. Reflect on the cause and propose a correction.

User intent: {intent}

Tool: {tool}

Parameters:
{params}

Error: {error}

Verification: {verification}

Attempt: {attempt}

Past reflections for this tool:
{history}

Choose strategy from: {strategies}
Use ABANDON when no change to the parameters can make the call succeed.

Return JSON:
{{"shouldRetry": true, "strategy": "FORMAT_FIX", "correctedParams": {{...}}, "reflection": "...", "confidence": 0.0}}

JSON only:"#,
        intent = truncate(&request.user_intent, 500),
        tool = request.tool_name,
        params = truncate(&params, 2000),
        error = truncate(&request.error_message, 1000),
        verification = verification,
        attempt = request.attempt_number,
        history = history,
        strategies = strategies,
    )
}

/// Parse the model reply into a decision before local gating
fn parse_decision(reply: &str) -> Option<CorrectionDecision> {
    let body = strip_code_fences(reply);
    let json_str = extract_json(body)?;
    let payload: ReflectionPayload = serde_json::from_str(json_str).ok()?;

    let strategy = payload
        .strategy
        .as_deref()
        .and_then(CorrectionStrategy::parse)
        .unwrap_or(CorrectionStrategy::FullRetry);

    let confidence = match payload.confidence {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    Some(CorrectionDecision {
        should_retry: payload.should_retry.unwrap_or(true),
        strategy,
        corrected_params: payload.corrected_params.filter(|v| !v.is_null()),
        reflection: payload.reflection.unwrap_or_default(),
        confidence,
    })
}

/// Drop a surrounding ``` fence (with optional language tag)
fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// First balanced JSON object, ignoring braces inside string literals
fn extract_json(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Truncate to at most `max` characters
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
