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

//! MCP transports.
//!
//! Two concrete transports back the client:
//! - **stdio**: a local subprocess speaking line-delimited JSON-RPC
//! - **HTTP**: a streamable endpoint answering either plain JSON or an SSE
//!   frame per request (SSE-configured servers use this same path)
//!
//! The bridge owns transports exclusively and serializes requests per
//! connection, so `&mut self` here is enough.

use crate::mcp::error::{MCPError, MCPResult};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Default timeout for a single MCP request (30 seconds).
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Transport-agnostic request/notify/close surface.
#[async_trait]
pub trait MCPTransport: Send + Sync {
    /// Sends a request and waits for the correlated response.
    async fn request(&mut self, request: JsonRpcRequest) -> MCPResult<JsonRpcResponse>;

    /// Sends a notification (no response expected).
    async fn notify(&mut self, notification: JsonRpcRequest) -> MCPResult<()>;

    /// Tears the connection down.
    async fn close(&mut self) -> MCPResult<()>;
}

// =============================================================================
// stdio
// =============================================================================

/// Local subprocess transport: one JSON-RPC message per line.
pub struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    timeout: Duration,
}

impl StdioTransport {
    /// Spawns the server process with piped stdio.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> MCPResult<Self> {
        info!(command = %command, args = ?args, "Spawning MCP stdio server");

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MCPError::ProcessSpawnFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| MCPError::IoError {
            context: "stdio spawn".to_string(),
            message: "child stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| MCPError::IoError {
            context: "stdio spawn".to_string(),
            message: "child stdout unavailable".to_string(),
        })?;

        Ok(Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        })
    }

    async fn write_line(&mut self, message: &JsonRpcRequest) -> MCPResult<()> {
        let line = serde_json::to_string(message)?;
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| MCPError::IoError {
                context: "stdio write".to_string(),
                message: e.to_string(),
            })?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| MCPError::IoError {
                context: "stdio write".to_string(),
                message: e.to_string(),
            })?;
        self.stdin.flush().await.map_err(|e| MCPError::IoError {
            context: "stdio flush".to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }
}

#[async_trait]
impl MCPTransport for StdioTransport {
    async fn request(&mut self, request: JsonRpcRequest) -> MCPResult<JsonRpcResponse> {
        let expected_id = request.id.clone();
        let method = request.method.clone();
        self.write_line(&request).await?;

        let reader = &mut self.reader;
        let read_response = async {
            let mut line = String::new();
            loop {
                line.clear();
                let bytes = reader.read_line(&mut line).await.map_err(|e| {
                    MCPError::IoError {
                        context: "stdio read".to_string(),
                        message: e.to_string(),
                    }
                })?;
                if bytes == 0 {
                    return Err(MCPError::IoError {
                        context: "stdio read".to_string(),
                        message: "server closed stdout".to_string(),
                    });
                }

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(response) if response.id.as_ref() == Some(&expected_id) => {
                        return Ok(response);
                    }
                    Ok(_) => {
                        // Server-initiated notification or unrelated frame
                        debug!("Skipping uncorrelated MCP frame");
                    }
                    Err(e) => {
                        warn!(error = %e, "Skipping unparseable MCP frame");
                    }
                }
            }
        };

        tokio::time::timeout(self.timeout, read_response)
            .await
            .map_err(|_| MCPError::Timeout {
                operation: method,
                timeout_ms: self.timeout.as_millis() as u64,
            })?
    }

    async fn notify(&mut self, notification: JsonRpcRequest) -> MCPResult<()> {
        self.write_line(&notification).await
    }

    async fn close(&mut self) -> MCPResult<()> {
        debug!("Killing MCP stdio server process");
        self.child.kill().await.map_err(|e| MCPError::IoError {
            context: "stdio close".to_string(),
            message: e.to_string(),
        })
    }
}

// =============================================================================
// HTTP / SSE
// =============================================================================

/// Streamable HTTP transport.
///
/// Each request is a POST; the server answers with `application/json` or a
/// single SSE frame (`text/event-stream`), both of which are handled here.
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Creates a transport for a remote endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    async fn post(&self, message: &JsonRpcRequest) -> MCPResult<reqwest::Response> {
        self.client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(message)
            .send()
            .await
            .map_err(|e| MCPError::ConnectionFailed {
                server: self.endpoint.clone(),
                message: e.to_string(),
            })
    }

    fn parse_body(&self, content_type: &str, body: &str) -> MCPResult<JsonRpcResponse> {
        if content_type.contains("text/event-stream") {
            // Single-response stream: take the first data frame
            for line in body.lines() {
                if let Some(data) = line.trim().strip_prefix("data:") {
                    let data = data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    return serde_json::from_str(data).map_err(Into::into);
                }
            }
            Err(MCPError::SerializationError {
                context: "SSE response".to_string(),
                message: "no data frame in event stream".to_string(),
            })
        } else {
            serde_json::from_str(body).map_err(Into::into)
        }
    }
}

#[async_trait]
impl MCPTransport for HttpTransport {
    async fn request(&mut self, request: JsonRpcRequest) -> MCPResult<JsonRpcResponse> {
        let response = self.post(&request).await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response.text().await.map_err(|e| MCPError::IoError {
            context: "http read".to_string(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(MCPError::ConnectionFailed {
                server: self.endpoint.clone(),
                message: format!("HTTP {}: {}", status, body),
            });
        }

        self.parse_body(&content_type, &body)
    }

    async fn notify(&mut self, notification: JsonRpcRequest) -> MCPResult<()> {
        let _ = self.post(&notification).await?;
        Ok(())
    }

    async fn close(&mut self) -> MCPResult<()> {
        // Stateless; nothing to tear down
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_parse_plain_json() {
        let transport = HttpTransport::new("http://localhost:9999/mcp");
        let response = transport
            .parse_body(
                "application/json",
                r#"{"jsonrpc":"2.0","result":{"ok":true},"id":1}"#,
            )
            .unwrap();
        assert_eq!(response.into_result().unwrap()["ok"], true);
    }

    #[test]
    fn test_http_parse_sse_frame() {
        let transport = HttpTransport::new("http://localhost:9999/mcp");
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"result\":{\"n\":5},\"id\":2}\n\n";
        let response = transport.parse_body("text/event-stream", body).unwrap();
        assert_eq!(response.into_result().unwrap()["n"], 5);
    }

    #[test]
    fn test_http_parse_sse_without_data_fails() {
        let transport = HttpTransport::new("http://localhost:9999/mcp");
        let err = transport
            .parse_body("text/event-stream", "event: ping\n\n")
            .unwrap_err();
        assert!(matches!(err, MCPError::SerializationError { .. }));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let result = StdioTransport::spawn(
            "definitely-not-a-real-binary-4217",
            &[],
            &HashMap::new(),
        );
        assert!(matches!(
            result,
            Err(MCPError::ProcessSpawnFailed { .. })
        ));
    }
}
