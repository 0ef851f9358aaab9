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

//! MCP-specific error types covering process spawning, JSON-RPC
//! communication and protocol failures.

use serde::Serialize;
use std::fmt;

/// Error category for filtering and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MCPErrorCategory {
    /// Network and connection errors (ConnectionFailed, Timeout, IoError)
    Connection,
    /// JSON-RPC and MCP protocol errors (ProtocolError, SerializationError)
    Protocol,
    /// Server-side or process errors (ProcessSpawnFailed, InitializationFailed)
    ServerInternal,
    /// Invalid configuration (InvalidConfig)
    Configuration,
    /// Resource not found (ToolNotFound, ServerNotFound)
    ResourceNotFound,
    /// Resilience pattern errors (CircuitBreakerOpen, RetryExhausted)
    Resilience,
}

impl std::fmt::Display for MCPErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MCPErrorCategory::Connection => write!(f, "connection"),
            MCPErrorCategory::Protocol => write!(f, "protocol"),
            MCPErrorCategory::ServerInternal => write!(f, "server_internal"),
            MCPErrorCategory::Configuration => write!(f, "configuration"),
            MCPErrorCategory::ResourceNotFound => write!(f, "resource_not_found"),
            MCPErrorCategory::Resilience => write!(f, "resilience"),
        }
    }
}

/// MCP operation error.
#[derive(Debug)]
pub enum MCPError {
    /// Failed to spawn the MCP server process
    ProcessSpawnFailed {
        /// Command that was attempted
        command: String,
        /// Underlying error message
        message: String,
    },
    /// Failed to connect to the MCP server
    ConnectionFailed {
        /// Server name
        server: String,
        /// Underlying error message
        message: String,
    },
    /// JSON-RPC protocol error
    ProtocolError {
        /// Error code from JSON-RPC
        code: i32,
        /// Error message
        message: String,
    },
    /// Server initialization handshake failed
    InitializationFailed {
        /// Server name
        server: String,
        /// Underlying error message
        message: String,
    },
    /// Requested tool was not found on the server
    ToolNotFound {
        /// Server name
        server: String,
        /// Tool name that was requested
        tool: String,
    },
    /// Requested server is not connected
    ServerNotFound {
        /// Server id or name that was requested
        server: String,
    },
    /// Operation timed out
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },
    /// I/O error during communication
    IoError {
        /// Context of the I/O operation
        context: String,
        /// Underlying error message
        message: String,
    },
    /// JSON serialization/deserialization error
    SerializationError {
        /// Context of the serialization
        context: String,
        /// Underlying error message
        message: String,
    },
    /// Invalid configuration
    InvalidConfig {
        /// Configuration field that is invalid
        field: String,
        /// Reason for invalidity
        reason: String,
    },
    /// Circuit breaker is open (server unhealthy)
    CircuitBreakerOpen {
        /// Server name
        server: String,
        /// Remaining cooldown in seconds before retry
        cooldown_remaining_secs: u64,
    },
    /// All retry attempts exhausted
    RetryExhausted {
        /// Server name
        server: String,
        /// Number of attempts made
        attempts: u32,
        /// Last error message
        last_error: String,
    },
}

impl fmt::Display for MCPError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MCPError::ProcessSpawnFailed { command, message } => {
                write!(f, "could not spawn MCP process '{}': {}", command, message)
            }
            MCPError::ConnectionFailed { server, message } => {
                write!(f, "connection to MCP server '{}' failed: {}", server, message)
            }
            MCPError::ProtocolError { code, message } => {
                write!(f, "JSON-RPC error {}: {}", code, message)
            }
            MCPError::InitializationFailed { server, message } => {
                write!(f, "MCP handshake with '{}' failed: {}", server, message)
            }
            MCPError::ToolNotFound { server, tool } => {
                write!(f, "tool '{}' is not exposed by MCP server '{}'", tool, server)
            }
            MCPError::ServerNotFound { server } => {
                write!(f, "MCP server '{}' is not connected", server)
            }
            MCPError::Timeout {
                operation,
                timeout_ms,
            } => {
                write!(f, "MCP operation '{}' timed out after {}ms", operation, timeout_ms)
            }
            MCPError::IoError { context, message } => {
                write!(f, "I/O failure in {}: {}", context, message)
            }
            MCPError::SerializationError { context, message } => {
                write!(f, "serialization failure in {}: {}", context, message)
            }
            MCPError::InvalidConfig { field, reason } => {
                write!(f, "invalid MCP configuration field '{}': {}", field, reason)
            }
            MCPError::CircuitBreakerOpen {
                server,
                cooldown_remaining_secs,
            } => {
                write!(
                    f,
                    "circuit open for MCP server '{}', next probe in {}s",
                    server, cooldown_remaining_secs
                )
            }
            MCPError::RetryExhausted {
                server,
                attempts,
                last_error,
            } => {
                write!(
                    f,
                    "MCP server '{}' still failing after {} attempts: {}",
                    server, attempts, last_error
                )
            }
        }
    }
}

impl std::error::Error for MCPError {}

impl MCPError {
    /// Returns the category of this error for filtering and reporting.
    pub fn category(&self) -> MCPErrorCategory {
        match self {
            MCPError::ConnectionFailed { .. } => MCPErrorCategory::Connection,
            MCPError::Timeout { .. } => MCPErrorCategory::Connection,
            MCPError::IoError { .. } => MCPErrorCategory::Connection,

            MCPError::ProtocolError { .. } => MCPErrorCategory::Protocol,
            MCPError::SerializationError { .. } => MCPErrorCategory::Protocol,

            MCPError::ProcessSpawnFailed { .. } => MCPErrorCategory::ServerInternal,
            MCPError::InitializationFailed { .. } => MCPErrorCategory::ServerInternal,

            MCPError::InvalidConfig { .. } => MCPErrorCategory::Configuration,

            MCPError::ToolNotFound { .. } => MCPErrorCategory::ResourceNotFound,
            MCPError::ServerNotFound { .. } => MCPErrorCategory::ResourceNotFound,

            MCPError::CircuitBreakerOpen { .. } => MCPErrorCategory::Resilience,
            MCPError::RetryExhausted { .. } => MCPErrorCategory::Resilience,
        }
    }

    /// Returns true if this is a transient error that may resolve with retry.
    ///
    /// Within a disconnect grace window this is what allows the retry policy
    /// to redeem a tool call once the server reconnects.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            MCPErrorCategory::Connection | MCPErrorCategory::Resilience
        )
    }
}

impl From<std::io::Error> for MCPError {
    fn from(err: std::io::Error) -> Self {
        MCPError::IoError {
            context: "I/O operation".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for MCPError {
    fn from(err: serde_json::Error) -> Self {
        MCPError::SerializationError {
            context: "JSON processing".to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for MCP operations.
pub type MCPResult<T> = Result<T, MCPError>;
