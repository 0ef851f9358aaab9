// Copyright 2025 Zileo-Chat-3 Contributors
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC 2.0 and MCP protocol types.
//!
//! Reference: https://modelcontextprotocol.io/specification/2025-06-18

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::hash::{Hash, Hasher};

/// MCP protocol version supported by this implementation.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Application name used in MCP client info.
pub const MCP_CLIENT_NAME: &str = "Soline";

/// Application version used in MCP client info.
pub const MCP_CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// JSON-RPC 2.0 Core Types
// =============================================================================

/// JSON-RPC request ID: number, string, or null per the 2.0 spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
    #[default]
    Null,
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Method name to invoke
    pub method: String,
    /// Optional method parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request ID for correlation
    pub id: JsonRpcId,
}

impl JsonRpcRequest {
    /// Creates a request with a numeric ID.
    pub fn new(method: &str, params: Option<Value>, id: i64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: JsonRpcId::Number(id),
        }
    }

    /// Creates a notification (no response expected).
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: JsonRpcId::Null,
        }
    }
}

/// JSON-RPC 2.0 response.
///
/// Server-to-client notifications may omit the `id` field; it defaults so
/// such frames deserialize cleanly and can be skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Result on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Request ID for correlation
    #[serde(default)]
    pub id: Option<JsonRpcId>,
}

impl JsonRpcResponse {
    /// Extracts the result value, surfacing a protocol error if present.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Human-readable error message
    pub message: String,
    /// Optional additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// =============================================================================
// MCP Handshake & Tool Types
// =============================================================================

/// Parameters for the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MCPInitializeParams {
    /// Protocol version the client supports
    pub protocol_version: String,
    /// Client capabilities (none advertised)
    pub capabilities: Value,
    /// Client information
    pub client_info: MCPClientInfo,
}

impl Default for MCPInitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: MCPClientInfo::default(),
        }
    }
}

/// Client identification sent during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MCPClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for MCPClientInfo {
    fn default() -> Self {
        Self {
            name: MCP_CLIENT_NAME.to_string(),
            version: MCP_CLIENT_VERSION.to_string(),
        }
    }
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MCPInitializeResult {
    /// Protocol version the server speaks
    pub protocol_version: String,
    /// Server capabilities (opaque here)
    #[serde(default)]
    pub capabilities: Value,
    /// Server information
    pub server_info: MCPServerInfo,
}

/// Server identification from the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MCPServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// A tool as described by a server's `tools/list` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MCPToolDefinition {
    /// Tool name (unprefixed, as the server knows it)
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's input
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

impl MCPToolDefinition {
    /// Stable hash of the definition, used to detect schema changes at
    /// reconnect (a mismatch re-registers the tool and re-prompts trust).
    pub fn definition_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.name.hash(&mut hasher);
        self.description.hash(&mut hasher);
        self.input_schema.to_string().hash(&mut hasher);
        hasher.finish()
    }
}

/// Result of `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MCPToolsListResult {
    #[serde(default)]
    pub tools: Vec<MCPToolDefinition>,
}

/// Parameters for `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MCPToolCallParams {
    /// Tool name (unprefixed)
    pub name: String,
    /// Tool arguments
    pub arguments: Value,
}

/// One content block of a tool call response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MCPContent {
    /// Content type ("text" is the only one consumed here)
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text payload for text content
    #[serde(default)]
    pub text: String,
}

/// Result of `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MCPToolCallResponse {
    /// Content blocks returned by the tool
    #[serde(default)]
    pub content: Vec<MCPContent>,
    /// True when the tool reports failure
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl MCPToolCallResponse {
    /// Concatenated text content.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|c| c.content_type == "text")
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
