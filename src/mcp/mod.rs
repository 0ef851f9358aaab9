// Copyright 2025 Zileo-Chat-3 Contributors
// SPDX-License-Identifier: Apache-2.0

//! MCP (Model Context Protocol) client stack.
//!
//! - [`protocol`] - JSON-RPC 2.0 and MCP handshake types
//! - [`transport`] - stdio / HTTP / SSE transports
//! - [`client`] - per-server typed client
//! - [`circuit_breaker`] - per-server failure breaker
//! - [`bridge`] - lifecycle coordinator wiring servers into the tool registry

pub mod bridge;
pub mod circuit_breaker;
pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;

pub use bridge::MCPBridge;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::MCPClient;
pub use error::{MCPError, MCPErrorCategory, MCPResult};
pub use protocol::{JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse};
