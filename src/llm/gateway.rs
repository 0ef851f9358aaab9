// Copyright 2025 Assistance Micro Design
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Gateway trait and common LLM types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default per-call timeout in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 120;

/// Message role in a chat exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// One message in a chat exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Recognized per-call options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Model to use (provider default when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider to route to (gateway default when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum tokens to generate
    pub max_tokens: usize,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
    /// Whether the caller wants streamed delivery
    pub streaming: bool,
    /// Providers to try when the primary fails
    #[serde(default)]
    pub fallback_providers: Vec<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider: None,
            temperature: 0.7,
            max_tokens: 4096,
            timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            streaming: false,
            fallback_providers: Vec::new(),
        }
    }
}

impl ChatConfig {
    /// Sets the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the provider.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// A completed (non-streaming) chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Generated text content
    pub content: String,
    /// Number of input tokens (prompt)
    pub tokens_input: u64,
    /// Number of output tokens (completion)
    pub tokens_output: u64,
    /// Model used for generation
    pub model: String,
    /// Provider used
    pub provider: String,
    /// Finish reason (if reported)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One chunk of a streamed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Partial content
    pub content: String,
}

/// Gateway error taxonomy.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transient provider-side failure; retriable
    #[error("Provider error: {0}")]
    Provider(String),

    /// Rate limited; retriable after the provider-specified delay
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Authentication failure; fatal to that provider
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Prompt exceeded the model's context window; fatal to the call
    #[error("Context window exceeded: {0}")]
    ContextExceeded(String),

    /// Programming or serialization error
    #[error("Internal gateway error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// True for failures a backoff retry may redeem.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Provider(_) | GatewayError::RateLimited { .. }
        )
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

/// Rough token estimate used for budget pre-charges.
///
/// One token per ~4 characters plus a small envelope constant. Reconciled
/// against real usage after the call returns.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4) + 8
}

/// Capability-typed interface to the LLM backend.
///
/// Implementations must be cheap to share (`Arc<dyn Gateway>`): one gateway
/// serves every session in the process.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Identifier used in events and traces (e.g. "openai", "demo").
    fn name(&self) -> &str;

    /// Whether the gateway has what it needs (endpoint, key) to serve calls.
    fn is_configured(&self) -> bool {
        true
    }

    /// Generates a completion for the given messages.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
    ) -> Result<ChatResponse, GatewayError>;

    /// Generates a streaming completion.
    ///
    /// Returns a receiver of content deltas. The channel closes when the
    /// stream ends; errors arrive in-band.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamDelta, GatewayError>>, GatewayError>;

    /// Embeds a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_config_defaults() {
        let config = ChatConfig::default();
        assert!(config.model.is_none());
        assert!((config.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.timeout_secs, DEFAULT_CALL_TIMEOUT_SECS);
        assert!(!config.streaming);
        assert!(config.fallback_providers.is_empty());
    }

    #[test]
    fn test_gateway_error_retryability() {
        assert!(GatewayError::Provider("503".into()).is_retryable());
        assert!(GatewayError::RateLimited {
            retry_after_ms: 1000
        }
        .is_retryable());
        assert!(!GatewayError::Unauthorized("bad key".into()).is_retryable());
        assert!(!GatewayError::ContextExceeded("too long".into()).is_retryable());
        assert!(!GatewayError::Internal("bug".into()).is_retryable());
    }

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::user("hello");
        assert_eq!(msg.role, MessageRole::User);
        assert_eq!(msg.content, "hello");

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"role\":\"user\""));
    }

    #[test]
    fn test_estimate_tokens_scales_with_length() {
        assert_eq!(estimate_tokens(""), 8);
        let short = estimate_tokens("hello");
        let long = estimate_tokens(&"x".repeat(4000));
        assert!(long > short);
        assert_eq!(long, 1008);
    }
}
