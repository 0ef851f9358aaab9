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

//! Typed client for one MCP server.
//!
//! Wraps a transport with the MCP handshake, tool discovery and tool
//! invocation. The bridge owns clients exclusively and serializes access,
//! so methods take `&mut self`.

use crate::config::{McpServerConfig, McpTransportKind};
use crate::mcp::error::{MCPError, MCPResult};
use crate::mcp::protocol::{
    JsonRpcRequest, MCPInitializeParams, MCPInitializeResult, MCPServerInfo, MCPToolCallParams,
    MCPToolCallResponse, MCPToolDefinition, MCPToolsListResult,
};
use crate::mcp::transport::{HttpTransport, MCPTransport, StdioTransport};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info};

/// Client for a single connected MCP server.
pub struct MCPClient {
    config: McpServerConfig,
    transport: Box<dyn MCPTransport>,
    tools: Vec<MCPToolDefinition>,
    server_info: Option<MCPServerInfo>,
    request_id: AtomicI64,
}

impl MCPClient {
    /// Opens the transport, performs the MCP handshake and lists tools.
    pub async fn connect(config: McpServerConfig) -> MCPResult<Self> {
        let transport = Self::open_transport(&config)?;
        let mut client = Self {
            config,
            transport,
            tools: Vec::new(),
            server_info: None,
            request_id: AtomicI64::new(1),
        };

        let init = client.initialize().await?;
        info!(
            server_id = %client.config.id,
            server_name = %client.config.name,
            remote_name = %init.server_info.name,
            protocol = %init.protocol_version,
            "MCP server initialized"
        );
        client.server_info = Some(init.server_info);

        client.refresh_tools().await?;
        Ok(client)
    }

    fn open_transport(config: &McpServerConfig) -> MCPResult<Box<dyn MCPTransport>> {
        match &config.transport {
            McpTransportKind::Stdio { command, args, env } => {
                Ok(Box::new(StdioTransport::spawn(command, args, env)?))
            }
            // SSE servers answer the same streamable-HTTP POST dialect
            McpTransportKind::Http { endpoint } | McpTransportKind::Sse { endpoint } => {
                if endpoint.is_empty() {
                    return Err(MCPError::InvalidConfig {
                        field: "endpoint".to_string(),
                        reason: "must not be empty".to_string(),
                    });
                }
                Ok(Box::new(HttpTransport::new(endpoint)))
            }
        }
    }

    fn next_id(&self) -> i64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn initialize(&mut self) -> MCPResult<MCPInitializeResult> {
        let params = serde_json::to_value(MCPInitializeParams::default())?;
        let request = JsonRpcRequest::new("initialize", Some(params), self.next_id());

        let response = self.transport.request(request).await?;
        let result = response.into_result().map_err(|e| MCPError::InitializationFailed {
            server: self.config.name.clone(),
            message: format!("code {}: {}", e.code, e.message),
        })?;

        let init: MCPInitializeResult = serde_json::from_value(result)?;

        self.transport
            .notify(JsonRpcRequest::notification(
                "notifications/initialized",
                None,
            ))
            .await?;

        Ok(init)
    }

    /// Re-queries the server's tool list and caches it.
    pub async fn refresh_tools(&mut self) -> MCPResult<&[MCPToolDefinition]> {
        let request = JsonRpcRequest::new("tools/list", None, self.next_id());
        let response = self.transport.request(request).await?;
        let result = response.into_result().map_err(|e| MCPError::ProtocolError {
            code: e.code,
            message: e.message,
        })?;

        let listed: MCPToolsListResult = serde_json::from_value(result)?;
        debug!(
            server_name = %self.config.name,
            tools_count = listed.tools.len(),
            "Refreshed MCP tool list"
        );
        self.tools = listed.tools;
        Ok(&self.tools)
    }

    /// Invokes a tool by its unprefixed name.
    pub async fn call_tool(
        &mut self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> MCPResult<MCPToolCallResponse> {
        if !self.tools.iter().any(|t| t.name == tool_name) {
            return Err(MCPError::ToolNotFound {
                server: self.config.name.clone(),
                tool: tool_name.to_string(),
            });
        }

        let params = serde_json::to_value(MCPToolCallParams {
            name: tool_name.to_string(),
            arguments,
        })?;
        let request = JsonRpcRequest::new("tools/call", Some(params), self.next_id());

        let response = self.transport.request(request).await?;
        let result = response.into_result().map_err(|e| MCPError::ProtocolError {
            code: e.code,
            message: e.message,
        })?;

        let call_result: MCPToolCallResponse = serde_json::from_value(result)?;
        Ok(call_result)
    }

    /// Closes the transport.
    pub async fn disconnect(&mut self) -> MCPResult<()> {
        info!(server_name = %self.config.name, "Disconnecting MCP server");
        self.transport.close().await
    }

    /// Cached tool definitions from the last `tools/list`.
    pub fn tools(&self) -> &[MCPToolDefinition] {
        &self.tools
    }

    /// The server configuration this client was built from.
    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    /// Remote server identification, once connected.
    pub fn server_info(&self) -> Option<&MCPServerInfo> {
        self.server_info.as_ref()
    }
}
