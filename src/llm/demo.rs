// Copyright 2025 Zileo-Chat-3 Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deterministic offline gateway for development and tests.
//!
//! No network, no keys; responses are derived from the last user message so
//! tests stay reproducible.

use crate::llm::gateway::{
    ChatConfig, ChatMessage, ChatResponse, Gateway, GatewayError, MessageRole, StreamDelta,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Embedding dimension the demo gateway reports.
const DEMO_EMBED_DIM: usize = 8;

/// Gateway that answers locally without any provider.
pub struct DemoGateway;

impl DemoGateway {
    pub fn new() -> Self {
        Self
    }

    fn reply_for(messages: &[ChatMessage]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");

        let preview: String = last_user.chars().take(120).collect();
        format!("Demo response: {}", preview)
    }
}

impl Default for DemoGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gateway for DemoGateway {
    fn name(&self) -> &str {
        "demo"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
    ) -> Result<ChatResponse, GatewayError> {
        let content = Self::reply_for(messages);
        let tokens_input: u64 = messages
            .iter()
            .map(|m| crate::llm::gateway::estimate_tokens(&m.content))
            .sum();
        let tokens_output = crate::llm::gateway::estimate_tokens(&content);

        Ok(ChatResponse {
            content,
            tokens_input,
            tokens_output,
            model: config.model.clone().unwrap_or_else(|| "demo".to_string()),
            provider: "demo".to_string(),
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        _config: &ChatConfig,
    ) -> Result<mpsc::Receiver<Result<StreamDelta, GatewayError>>, GatewayError> {
        let content = Self::reply_for(messages);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for word in content.split_inclusive(' ') {
                if tx
                    .send(Ok(StreamDelta {
                        content: word.to_string(),
                    }))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        // Length-derived pseudo-embeddings keep tests deterministic
        Ok(texts
            .iter()
            .map(|t| {
                let seed = t.len() as f32;
                (0..DEMO_EMBED_DIM)
                    .map(|i| ((seed + i as f32) % 10.0) / 10.0)
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_chat_echoes_user_message() {
        let gateway = DemoGateway::new();
        let messages = vec![
            ChatMessage::system("You are a planner"),
            ChatMessage::user("Echo hello"),
        ];

        let response = gateway.chat(&messages, &ChatConfig::default()).await.unwrap();
        assert!(response.content.contains("Echo hello"));
        assert_eq!(response.provider, "demo");
        assert!(response.tokens_input > 0);
        assert!(response.tokens_output > 0);
    }

    #[tokio::test]
    async fn test_demo_stream_reassembles_to_chat_content() {
        let gateway = DemoGateway::new();
        let messages = vec![ChatMessage::user("stream me")];

        let full = gateway
            .chat(&messages, &ChatConfig::default())
            .await
            .unwrap()
            .content;

        let mut rx = gateway
            .chat_stream(&messages, &ChatConfig::default())
            .await
            .unwrap();
        let mut assembled = String::new();
        while let Some(delta) = rx.recv().await {
            assembled.push_str(&delta.unwrap().content);
        }
        assert_eq!(assembled, full);
    }

    #[tokio::test]
    async fn test_demo_embed_dimensions() {
        let gateway = DemoGateway::new();
        let vectors = gateway
            .embed(&["a".to_string(), "longer text".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), DEMO_EMBED_DIM);
    }
}
