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

//! OpenAI-compatible HTTP gateway.
//!
//! Works against any endpoint speaking the `/chat/completions` and
//! `/embeddings` dialect (hosted APIs as well as local servers such as
//! Ollama's compatibility layer). Local endpoints do not require a key.

use crate::llm::gateway::{
    ChatConfig, ChatMessage, ChatResponse, Gateway, GatewayError, StreamDelta,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Gateway over an OpenAI-compatible HTTP API.
pub struct OpenAiGateway {
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    embed_model: String,
    client: reqwest::Client,
}

impl OpenAiGateway {
    /// Creates a gateway for an OpenAI-compatible endpoint.
    ///
    /// # Arguments
    /// * `name` - provider identifier used in events and traces
    /// * `base_url` - API root, e.g. `https://api.mistral.ai/v1`
    /// * `api_key` - bearer token; `None` for local endpoints
    /// * `default_model` - model used when the call config names none
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Self {
        let default_model = default_model.into();
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            embed_model: format!("{}-embed", default_model),
            default_model,
            client: reqwest::Client::new(),
        }
    }

    /// Overrides the embedding model name.
    pub fn with_embed_model(mut self, embed_model: impl Into<String>) -> Self {
        self.embed_model = embed_model.into();
        self
    }

    fn request(&self, path: &str, timeout_secs: u64) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .timeout(Duration::from_secs(timeout_secs.max(1)));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    fn chat_body(&self, messages: &[ChatMessage], config: &ChatConfig, stream: bool) -> Value {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        json!({
            "model": model,
            "messages": messages
                .iter()
                .map(|m| json!({ "role": m.role.to_string(), "content": m.content }))
                .collect::<Vec<_>>(),
            "temperature": config.temperature,
            "max_tokens": config.max_tokens,
            "stream": stream,
        })
    }

    fn map_error_status(status: reqwest::StatusCode, body: &str, retry_after: Option<u64>) -> GatewayError {
        match status.as_u16() {
            401 | 403 => GatewayError::Unauthorized(format!("HTTP {}: {}", status, body)),
            429 => GatewayError::RateLimited {
                retry_after_ms: retry_after.map(|s| s * 1000).unwrap_or(1000),
            },
            400 | 413 if body.contains("context") && body.contains("length") => {
                GatewayError::ContextExceeded(body.to_string())
            }
            400 if body.contains("maximum context") => {
                GatewayError::ContextExceeded(body.to_string())
            }
            _ => GatewayError::Provider(format!("HTTP {}: {}", status, body)),
        }
    }

    async fn check_response(response: reqwest::Response) -> Result<Value, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_error_status(status, &body, retry_after));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::Provider(format!("invalid JSON response: {}", e)))
    }
}

#[async_trait]
impl Gateway for OpenAiGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
            || self.base_url.starts_with("http://localhost")
            || self.base_url.starts_with("http://127.0.0.1")
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
    ) -> Result<ChatResponse, GatewayError> {
        let body = self.chat_body(messages, config, false);
        debug!(provider = %self.name, model = ?config.model, "Sending chat completion request");

        let response = self
            .request("/chat/completions", config.timeout_secs)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Provider(format!("request failed: {}", e)))?;

        let payload = Self::check_response(response).await?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let model = payload["model"]
            .as_str()
            .map(String::from)
            .or_else(|| config.model.clone())
            .unwrap_or_else(|| self.default_model.clone());

        Ok(ChatResponse {
            tokens_input: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            tokens_output: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            finish_reason: payload["choices"][0]["finish_reason"]
                .as_str()
                .map(String::from),
            provider: self.name.clone(),
            model,
            content,
        })
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
    ) -> Result<mpsc::Receiver<Result<StreamDelta, GatewayError>>, GatewayError> {
        let body = self.chat_body(messages, config, true);

        let response = self
            .request("/chat/completions", config.timeout_secs)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Provider(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_error_status(status, &body, None));
        }

        let (tx, rx) = mpsc::channel(32);
        let provider = self.name.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(GatewayError::Provider(format!(
                                "stream read failed: {}",
                                e
                            ))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE frames are newline-delimited; keep the trailing partial line
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        return;
                    }

                    match serde_json::from_str::<Value>(data) {
                        Ok(payload) => {
                            if let Some(content) =
                                payload["choices"][0]["delta"]["content"].as_str()
                            {
                                if tx
                                    .send(Ok(StreamDelta {
                                        content: content.to_string(),
                                    }))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(provider = %provider, error = %e, "Skipping malformed SSE frame");
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let body = json!({
            "model": self.embed_model,
            "input": texts,
        });

        let response = self
            .request("/embeddings", 60)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Provider(format!("request failed: {}", e)))?;

        let payload = Self::check_response(response).await?;

        let vectors = payload["data"]
            .as_array()
            .ok_or_else(|| GatewayError::Provider("embeddings payload missing 'data'".into()))?
            .iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect::<Vec<f32>>()
                    })
                    .ok_or_else(|| {
                        GatewayError::Provider("embedding item missing 'embedding'".into())
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let err = OpenAiGateway::map_error_status(
            reqwest::StatusCode::UNAUTHORIZED,
            "bad key",
            None,
        );
        assert!(matches!(err, GatewayError::Unauthorized(_)));

        let err = OpenAiGateway::map_error_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "slow down",
            Some(5),
        );
        match err {
            GatewayError::RateLimited { retry_after_ms } => assert_eq!(retry_after_ms, 5000),
            other => panic!("expected RateLimited, got {:?}", other),
        }

        let err = OpenAiGateway::map_error_status(
            reqwest::StatusCode::BAD_REQUEST,
            "context length exceeded for this model",
            None,
        );
        assert!(matches!(err, GatewayError::ContextExceeded(_)));

        let err = OpenAiGateway::map_error_status(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "oops",
            None,
        );
        assert!(matches!(err, GatewayError::Provider(_)));
    }

    #[test]
    fn test_local_endpoint_needs_no_key() {
        let local = OpenAiGateway::new("ollama", "http://localhost:11434/v1", None, "llama3");
        assert!(local.is_configured());

        let hosted = OpenAiGateway::new("mistral", "https://api.mistral.ai/v1", None, "mistral-small-latest");
        assert!(!hosted.is_configured());

        let hosted_with_key = OpenAiGateway::new(
            "mistral",
            "https://api.mistral.ai/v1",
            Some("key".to_string()),
            "mistral-small-latest",
        );
        assert!(hosted_with_key.is_configured());
    }

    #[test]
    fn test_chat_body_shape() {
        let gateway = OpenAiGateway::new("test", "http://localhost:1234/v1/", None, "m1");
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let body = gateway.chat_body(&messages, &ChatConfig::default(), true);

        assert_eq!(body["model"], "m1");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }
}
