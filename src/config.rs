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

//! Process configuration.
//!
//! One `CoreConfig` is loaded at startup and handed to components through
//! constructors; nothing reads configuration ambiently.

use crate::tools::TrustLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Default token budget per session.
pub const DEFAULT_TOKEN_BUDGET: u64 = 100_000;
/// Default iteration limit per session (LLM turns + tool calls).
pub const DEFAULT_ITERATION_LIMIT: u32 = 20;
/// Default wall-clock timeout per session in seconds.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 300;
/// Default delay before a graceful disconnect removes a server's tools.
pub const DEFAULT_GRACE_UNREGISTER_SECS: f64 = 5.0;
/// Default trace retention in days.
pub const DEFAULT_TRACE_RETENTION_DAYS: u32 = 30;
/// Default cap on stored raw input/output strings in bytes.
pub const DEFAULT_RAW_IO_TRUNCATE_BYTES: usize = 4096;
/// Default budget warning threshold fraction.
pub const DEFAULT_WARN_THRESHOLD: f64 = 0.8;

/// How an MCP server is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpTransportKind {
    /// Local subprocess over stdio
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Streamable HTTP endpoint
    Http { endpoint: String },
    /// SSE endpoint
    Sse { endpoint: String },
}

/// Configuration for one MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Stable server id (drives the tool name prefix)
    pub id: String,
    /// Display name
    pub name: String,
    /// Transport to reach the server
    pub transport: McpTransportKind,
    /// Trust level inherited by the server's tools
    #[serde(default)]
    pub trust_level: TrustLevel,
    /// Whether the server starts with the process
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Process-wide configuration with spec'd defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Persisted MCP server configurations
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    /// Token budget granted to each new session
    #[serde(default = "default_token_budget")]
    pub default_token_budget: u64,
    /// Iteration ceiling per session
    #[serde(default = "default_iteration_limit")]
    pub default_iteration_limit: u32,
    /// Wall-clock ceiling per session, seconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    /// Graceful-disconnect window, seconds
    #[serde(default = "default_grace_unregister")]
    pub grace_unregister_secs: f64,
    /// Trace retention, days
    #[serde(default = "default_trace_retention")]
    pub trace_retention_days: u32,
    /// Cap on stored raw I/O strings, bytes
    #[serde(default = "default_raw_io_truncate")]
    pub raw_io_truncate_bytes: usize,
    /// Budget warning threshold fraction
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,
    /// Skip safe/moderate approval prompts (destructive prompts remain)
    #[serde(default)]
    pub yolo: bool,
    /// Trace database path; defaults to `<home>/.soline/agent_traces.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

fn default_token_budget() -> u64 {
    DEFAULT_TOKEN_BUDGET
}
fn default_iteration_limit() -> u32 {
    DEFAULT_ITERATION_LIMIT
}
fn default_session_timeout() -> u64 {
    DEFAULT_SESSION_TIMEOUT_SECS
}
fn default_grace_unregister() -> f64 {
    DEFAULT_GRACE_UNREGISTER_SECS
}
fn default_trace_retention() -> u32 {
    DEFAULT_TRACE_RETENTION_DAYS
}
fn default_raw_io_truncate() -> usize {
    DEFAULT_RAW_IO_TRUNCATE_BYTES
}
fn default_warn_threshold() -> f64 {
    DEFAULT_WARN_THRESHOLD
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            mcp_servers: Vec::new(),
            default_token_budget: DEFAULT_TOKEN_BUDGET,
            default_iteration_limit: DEFAULT_ITERATION_LIMIT,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            grace_unregister_secs: DEFAULT_GRACE_UNREGISTER_SECS,
            trace_retention_days: DEFAULT_TRACE_RETENTION_DAYS,
            raw_io_truncate_bytes: DEFAULT_RAW_IO_TRUNCATE_BYTES,
            warn_threshold: DEFAULT_WARN_THRESHOLD,
            yolo: false,
            db_path: None,
        }
    }
}

impl CoreConfig {
    /// Loads configuration from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Resolves the trace database path, defaulting to the per-user location.
    pub fn trace_db_path(&self) -> PathBuf {
        if let Some(path) = &self.db_path {
            return path.clone();
        }
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".soline").join("agent_traces.db")
    }

    /// Enabled MCP server configurations.
    pub fn enabled_mcp_servers(&self) -> Vec<&McpServerConfig> {
        self.mcp_servers.iter().filter(|s| s.enabled).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.default_token_budget, 100_000);
        assert_eq!(config.default_iteration_limit, 20);
        assert_eq!(config.session_timeout_secs, 300);
        assert!((config.grace_unregister_secs - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.trace_retention_days, 30);
        assert_eq!(config.raw_io_truncate_bytes, 4096);
        assert!((config.warn_threshold - 0.8).abs() < f64::EPSILON);
        assert!(!config.yolo);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: CoreConfig = serde_json::from_str(r#"{ "default_token_budget": 5000 }"#).unwrap();
        assert_eq!(config.default_token_budget, 5000);
        assert_eq!(config.default_iteration_limit, 20);
        assert!(config.mcp_servers.is_empty());
    }

    #[test]
    fn test_mcp_server_config_round_trip() {
        let server = McpServerConfig {
            id: "a1b2c3d4e5".to_string(),
            name: "files".to_string(),
            transport: McpTransportKind::Stdio {
                command: "npx".to_string(),
                args: vec!["-y".to_string(), "@files/mcp".to_string()],
                env: HashMap::new(),
            },
            trust_level: TrustLevel::Moderate,
            enabled: true,
        };

        let json = serde_json::to_string(&server).unwrap();
        assert!(json.contains("\"type\":\"stdio\""));
        let restored: McpServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, server);
    }

    #[test]
    fn test_http_transport_deserialization() {
        let server: McpServerConfig = serde_json::from_str(
            r#"{
                "id": "srv1",
                "name": "remote",
                "transport": { "type": "http", "endpoint": "https://mcp.example.com" }
            }"#,
        )
        .unwrap();
        assert!(server.enabled, "enabled defaults to true");
        assert_eq!(server.trust_level, TrustLevel::Moderate);
        assert!(matches!(server.transport, McpTransportKind::Http { .. }));
    }

    #[test]
    fn test_trace_db_path_override() {
        let mut config = CoreConfig::default();
        let default_path = config.trace_db_path();
        assert!(default_path.ends_with(".soline/agent_traces.db"));

        config.db_path = Some(PathBuf::from("/tmp/custom.db"));
        assert_eq!(config.trace_db_path(), PathBuf::from("/tmp/custom.db"));
    }

    #[test]
    fn test_enabled_mcp_servers_filter() {
        let mut config = CoreConfig::default();
        config.mcp_servers = vec![
            McpServerConfig {
                id: "a".to_string(),
                name: "on".to_string(),
                transport: McpTransportKind::Http {
                    endpoint: "http://x".to_string(),
                },
                trust_level: TrustLevel::Trusted,
                enabled: true,
            },
            McpServerConfig {
                id: "b".to_string(),
                name: "off".to_string(),
                transport: McpTransportKind::Http {
                    endpoint: "http://y".to_string(),
                },
                trust_level: TrustLevel::Trusted,
                enabled: false,
            },
        ];
        let enabled = config.enabled_mcp_servers();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "on");
    }
}
