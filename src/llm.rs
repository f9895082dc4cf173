//! Completion Client
//!
//! The reflective corrector talks to a language model through
//! [`CompletionClient`]. [`ClaudeClient`] is the Anthropic Messages API
//! implementation; tests plug in scripted clients.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One chat message (`system`, `user` or `assistant`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Completion request: model hint plus ordered messages
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: usize,
}

/// What the model sent back
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionReply {
    Text(String),
    /// Error payload returned by the provider
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("ANTHROPIC_API_KEY not set - reflective correction unavailable")]
    NotConfigured,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Language-model completion collaborator
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionReply, LlmError>;
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    r#type: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<SystemBlock>,
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    r#type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: usize,
    output_tokens: usize,
}

/// Anthropic Messages API client
#[derive(Clone)]
pub struct ClaudeClient {
    client: Client,
    api_key: Option<String>,
}

impl ClaudeClient {
    pub fn new(api_key: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.map(|s| s.to_string()),
        }
    }

    /// Create from config
    pub fn from_config(config: &crate::config::GuardConfig) -> Self {
        Self::new(config.anthropic_api_key.as_deref())
    }

    /// Check if API key is configured
    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    /// Get model ID from hint; full model ids pass through
    fn model_id(model: &str) -> String {
        match model.to_lowercase().as_str() {
            "haiku" => "claude-3-5-haiku-20241022".to_string(),
            "opus" => "claude-3-opus-20240229".to_string(),
            "sonnet" | "" => "claude-sonnet-4-20250514".to_string(),
            other if other.starts_with("claude-") => model.to_string(),
            _ => "claude-sonnet-4-20250514".to_string(),
        }
    }

    /// System-role messages become system blocks, the rest keep their order
    fn build_request(request: CompletionRequest) -> MessageRequest {
        let mut system = Vec::new();
        let mut messages = Vec::new();

        for message in request.messages {
            if message.role == "system" {
                system.push(SystemBlock {
                    r#type: "text".to_string(),
                    text: message.content,
                });
            } else {
                messages.push(Message {
                    role: message.role,
                    content: message.content,
                });
            }
        }

        MessageRequest {
            model: Self::model_id(&request.model),
            max_tokens: request.max_tokens,
            system,
            messages,
        }
    }
}

#[async_trait]
impl CompletionClient for ClaudeClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionReply, LlmError> {
        let api_key = self.api_key.as_ref().ok_or(LlmError::NotConfigured)?;
        let body = Self::build_request(request);

        debug!(
            "Calling Claude API: model={}, messages={}",
            body.model,
            body.messages.len()
        );

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Ok(CompletionReply::Error(format!("Claude API error {}: {}", status, text)));
        }

        let result: MessageResponse = response.json().await?;

        let content = result
            .content
            .into_iter()
            .filter_map(|b| if b.r#type == "text" { b.text } else { None })
            .collect::<Vec<_>>()
            .join("\n");

        info!(
            "Claude response: model={}, in={}, out={}",
            body.model, result.usage.input_tokens, result.usage.output_tokens
        );

        Ok(CompletionReply::Text(content))
    }
}
