//! LLM client seam shared by the evaluator's `LLM(...)` call target and the
//! worker manager.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LLMRequestOptions {
    pub provider: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    /// Effective configuration (definition base config plus overrides).
    pub config: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct LLMResponse {
    pub content: String,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResponseMetadata {
    pub model: String,
    /// (input tokens, output tokens)
    pub token_usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

pub type TokenUsage = (u64, u64);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LLMError {
    #[error("API error: {0}")]
    Api(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Request timed out after {0} ms")]
    Timeout(u64),
    #[error("No LLM client configured")]
    NotConfigured,
}

impl LLMError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LLMError::RateLimit(_) => ErrorKind::RateLimited,
            LLMError::InvalidRequest(_) => ErrorKind::InvalidArgument,
            LLMError::NotConfigured => ErrorKind::Configuration,
            _ => ErrorKind::LLM,
        }
    }
}

pub type LLMResult<T> = Result<T, LLMError>;

#[mockall::automock]
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn ask(
        &self,
        turns: &[ConversationTurn],
        options: &LLMRequestOptions,
    ) -> LLMResult<LLMResponse>;

    fn name(&self) -> &str;
}

/// Rough token estimate used when a client reports no usage.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Deterministic stand-in for a real LLM call.
pub fn mock_response(model: &str, turns: &[ConversationTurn]) -> LLMResponse {
    let prompt = turns
        .iter()
        .rev()
        .find(|t| t.role == Role::User)
        .map(|t| t.content.as_str())
        .unwrap_or_default();
    let input: String = turns.iter().map(|t| t.content.as_str()).collect();
    let content = format!("Mock response from {} to: {}", model, prompt);
    LLMResponse {
        metadata: ResponseMetadata {
            model: model.to_string(),
            token_usage: Some((estimate_tokens(&input), estimate_tokens(&content))),
            finish_reason: Some("mock".to_string()),
        },
        content,
    }
}
