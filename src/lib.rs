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

//! # Soline Agent Execution Core
//!
//! Backend core of the Soline local AI workspace: plans, executes, traces
//! and safely controls multi-step tool-using tasks.
//!
//! ## Modules
//!
//! - [`events`] - bounded multi-subscriber event fan-out
//! - [`budget`] - per-session token budget with pre-charge accounting
//! - [`tools`] - tool trait, registry and built-ins
//! - [`approval`] - risk-tiered human-in-the-loop gate
//! - [`planner`] - plan generation with single-step fallback
//! - [`executor`] - session state machine and step loop
//! - [`mcp`] - MCP client stack and server lifecycle bridge
//! - [`trace`] - append-only persistence with retention
//! - [`llm`] - gateway abstraction over LLM providers
//!
//! ## Architecture
//!
//! A task flows from [`Executor::submit`](executor::Executor::submit)
//! through the [`Planner`](planner::Planner) into the executor's step loop,
//! which resolves tools from the [`ToolRegistry`](tools::ToolRegistry)
//! (populated by the [`MCPBridge`](mcp::MCPBridge)) and gates risky steps
//! through the [`ApprovalManager`](approval::ApprovalManager). Every
//! transition is published on the [`EventEmitter`](events::EventEmitter)
//! and persisted by the [`TraceStore`](trace::TraceStore).
//!
//! ## Example
//!
//! ```rust,ignore
//! use soline_core::{CoreConfig, CoreState};
//!
//! let state = CoreState::new(CoreConfig::default()).await?;
//! let session_id = state.executor.submit("Echo hello").await;
//! let summary = state.executor.wait(&session_id).await;
//! ```

pub mod approval;
pub mod budget;
pub mod config;
pub mod events;
pub mod executor;
pub mod llm;
pub mod logging;
pub mod mcp;
pub mod models;
pub mod planner;
pub mod state;
pub mod tools;
pub mod trace;

pub use approval::ApprovalManager;
pub use budget::TokenBudget;
pub use config::{CoreConfig, McpServerConfig, McpTransportKind};
pub use events::{AgentEvent, EventEmitter, EventType};
pub use executor::Executor;
pub use mcp::{MCPBridge, MCPClient, MCPError, MCPResult};
pub use state::CoreState;
pub use tools::ToolRegistry;
pub use trace::TraceStore;
