// Copyright 2025 Zileo-Chat-3 Contributors
// SPDX-License-Identifier: Apache-2.0

//! Agent Tools Framework
//!
//! Provides the trait and types for agent-callable tools.
//!
//! # Overview
//!
//! Tools are the executor's only mechanism for acting on the outside world:
//! - **Built-in tools**: Rust-native tools compiled into the core (`chat`, `echo`)
//! - **MCP tools**: remote tools proxied through the MCP bridge
//!
//! Both variants implement the same [`Tool`] trait; the executor never
//! special-cases one or the other beyond what the registry records in the
//! tool's [`ToolDefinition`].

pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[allow(unused_imports)]
pub use builtin::{ChatTool, EchoTool};
#[allow(unused_imports)]
pub use registry::ToolRegistry;

/// Trust level attached to a tool source and inherited by its tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    #[default]
    Moderate,
    Untrusted,
}

impl TrustLevel {
    /// The risk tier a tool of this trust level implies when the step itself
    /// does not declare a higher one.
    pub fn implied_risk(&self) -> crate::models::plan::RiskTier {
        use crate::models::plan::RiskTier;
        match self {
            TrustLevel::Trusted => RiskTier::Safe,
            TrustLevel::Moderate => RiskTier::Moderate,
            TrustLevel::Untrusted => RiskTier::Destructive,
        }
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustLevel::Trusted => write!(f, "trusted"),
            TrustLevel::Moderate => write!(f, "moderate"),
            TrustLevel::Untrusted => write!(f, "untrusted"),
        }
    }
}

/// Where a tool comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ToolSource {
    /// Compiled into the core
    Builtin,
    /// Proxied from an external MCP server
    Mcp {
        /// Id of the providing server
        server_id: String,
    },
}

impl ToolSource {
    /// True for MCP-proxied tools.
    pub fn is_mcp(&self) -> bool {
        matches!(self, ToolSource::Mcp { .. })
    }
}

/// Tool metadata for registry listing and LLM tool selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Registry-visible unique name (MCP tools carry their server prefix)
    pub name: String,
    /// Description for the LLM (critical for tool selection)
    pub description: String,
    /// JSON Schema for input validation
    pub input_schema: Value,
    /// Origin of the tool
    pub source: ToolSource,
    /// Trust level inherited from the source
    pub trust: TrustLevel,
}

/// Tool execution result type.
pub type ToolResult<T> = Result<T, ToolError>;

/// Errors that can occur during tool execution.
///
/// Each variant provides structured, actionable feedback for agents:
/// what went wrong and how to fix it.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Invalid input parameters - check the input_schema for valid format
    InvalidInput(String),
    /// Tool execution failed - operation could not complete
    ExecutionFailed(String),
    /// Resource not found - verify the ID exists before referencing
    NotFound(String),
    /// Permission denied - operation requires approval
    PermissionDenied(String),
    /// Operation timed out
    Timeout(String),
    /// Input or output violated the declared schema
    SchemaValidation(String),
    /// Transport-level failure reaching an external tool server
    Transport(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(
                f,
                "[INVALID_INPUT] {}. Check the tool's input_schema for required fields and valid formats.",
                msg
            ),
            Self::ExecutionFailed(msg) => write!(
                f,
                "[EXECUTION_FAILED] {}. The operation could not complete. Review the parameters and retry.",
                msg
            ),
            Self::NotFound(msg) => write!(
                f,
                "[NOT_FOUND] {}. The requested resource does not exist. Verify the name is correct.",
                msg
            ),
            Self::PermissionDenied(msg) => write!(
                f,
                "[PERMISSION_DENIED] {}. This operation requires user approval.",
                msg
            ),
            Self::Timeout(msg) => write!(
                f,
                "[TIMEOUT] {}. Operation took too long. Consider breaking into smaller tasks.",
                msg
            ),
            Self::SchemaValidation(msg) => write!(
                f,
                "[SCHEMA_VALIDATION] {}. The payload does not match the declared schema. Correct the fields and retry.",
                msg
            ),
            Self::Transport(msg) => write!(
                f,
                "[TRANSPORT] {}. The tool server could not be reached. This may be transient - retry after a moment.",
                msg
            ),
        }
    }
}

impl std::error::Error for ToolError {}

impl From<String> for ToolError {
    fn from(s: String) -> Self {
        ToolError::ExecutionFailed(s)
    }
}

impl ToolError {
    /// True for failures that a backoff retry may redeem.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ToolError::ExecutionFailed(_) | ToolError::Timeout(_) | ToolError::Transport(_)
        )
    }
}

/// Tool trait - unified interface for built-in and MCP-proxied tools.
///
/// The trait is async-safe and thread-safe (`Send + Sync`).
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns tool metadata, including the registry-visible name.
    fn definition(&self) -> ToolDefinition;

    /// Executes the tool with JSON input.
    ///
    /// # Arguments
    /// * `input` - JSON object conforming to the tool's input schema
    ///
    /// # Returns
    /// * `Ok(Value)` - JSON result on success
    /// * `Err(ToolError)` - structured error on failure
    async fn execute(&self, input: Value) -> ToolResult<Value>;

    /// Validates input before execution.
    fn validate_input(&self, _input: &Value) -> ToolResult<()> {
        Ok(())
    }
}
