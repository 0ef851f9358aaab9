// Copyright 2025 Zileo-Chat-3 Contributors
// SPDX-License-Identifier: Apache-2.0

//! Built-in tools registered at startup.

use crate::llm::{ChatConfig, ChatMessage, Gateway};
use crate::tools::{Tool, ToolDefinition, ToolError, ToolResult, ToolSource, TrustLevel};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Echoes its `text` argument back. Useful for wiring tests and as the
/// smallest possible tool example.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: "Returns the provided text unchanged.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Text to echo back" }
                },
                "required": ["text"]
            }),
            source: ToolSource::Builtin,
            trust: TrustLevel::Trusted,
        }
    }

    async fn execute(&self, input: Value) -> ToolResult<Value> {
        self.validate_input(&input)?;
        let text = input["text"].as_str().unwrap_or_default();
        Ok(json!({ "text": text }))
    }

    fn validate_input(&self, input: &Value) -> ToolResult<()> {
        if !input["text"].is_string() {
            return Err(ToolError::InvalidInput(
                "'text' must be a string".to_string(),
            ));
        }
        Ok(())
    }
}

/// Generic conversation tool backing the single-step fallback plan.
///
/// Sends the `prompt` argument to the gateway and returns the reply together
/// with token usage so the executor can reconcile its budget pre-charge.
pub struct ChatTool {
    gateway: Arc<dyn Gateway>,
}

impl ChatTool {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Tool for ChatTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "chat".to_string(),
            description: "Sends a prompt to the configured language model and returns the reply."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string", "description": "Prompt for the model" },
                    "model": { "type": "string", "description": "Optional model override" }
                },
                "required": ["prompt"]
            }),
            source: ToolSource::Builtin,
            trust: TrustLevel::Trusted,
        }
    }

    async fn execute(&self, input: Value) -> ToolResult<Value> {
        self.validate_input(&input)?;
        let prompt = input["prompt"].as_str().unwrap_or_default();

        let mut config = ChatConfig::default();
        if let Some(model) = input["model"].as_str() {
            config.model = Some(model.to_string());
        }

        let messages = vec![ChatMessage::user(prompt)];
        let response = self
            .gateway
            .chat(&messages, &config)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        Ok(json!({
            "content": response.content,
            "tokens_input": response.tokens_input,
            "tokens_output": response.tokens_output,
            "model": response.model,
            "provider": response.provider,
        }))
    }

    fn validate_input(&self, input: &Value) -> ToolResult<()> {
        if !input["prompt"].is_string() {
            return Err(ToolError::InvalidInput(
                "'prompt' must be a string".to_string(),
            ));
        }
        Ok(())
    }
}
