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

//! Centralized registry for tool discovery and name resolution.
//!
//! The registry maps globally unique names to invokable tools. It never
//! executes anything itself. MCP-sourced names carry a deterministic prefix
//! derived from their server id, which namespaces them and enables bulk
//! unregistration when a server goes away.

use crate::tools::{Tool, ToolDefinition, ToolSource, TrustLevel};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Number of server-id characters folded into the MCP name prefix.
const MCP_PREFIX_ID_LEN: usize = 8;

/// A registered tool: its registry-visible metadata plus the invoker.
#[derive(Clone)]
pub struct RegisteredTool {
    /// Metadata under the registry-visible (possibly prefixed) name
    pub definition: ToolDefinition,
    /// The invokable behind the name
    pub invoker: Arc<dyn Tool>,
}

/// Process-wide tool catalog.
///
/// # Thread Safety
///
/// Uses `RwLock` internally and is safe to share via `Arc<ToolRegistry>`.
/// Callers see a read-only view except through the explicit register and
/// unregister methods.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// The deterministic name prefix for tools of one MCP server.
    pub fn server_prefix(server_id: &str) -> String {
        let short: String = server_id.chars().take(MCP_PREFIX_ID_LEN).collect();
        format!("mcp_{}_", short)
    }

    /// Registers a built-in tool under its own definition name.
    ///
    /// A second registration of an already-present name is a no-op that
    /// logs a warning.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let definition = tool.definition();
        let name = definition.name.clone();

        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            warn!(tool_name = %name, "Tool already registered, ignoring duplicate");
            return;
        }

        tools.insert(
            name.clone(),
            RegisteredTool {
                definition,
                invoker: tool,
            },
        );
        debug!(tool_name = %name, "Tool registered");
    }

    /// Registers a single MCP-proxied tool, applying the server prefix.
    pub async fn register_mcp_tool(
        &self,
        server_id: &str,
        trust: TrustLevel,
        tool: Arc<dyn Tool>,
    ) {
        let mut definition = tool.definition();
        let prefix = Self::server_prefix(server_id);
        if !definition.name.starts_with(&prefix) {
            definition.name = format!("{}{}", prefix, definition.name);
        }
        definition.source = ToolSource::Mcp {
            server_id: server_id.to_string(),
        };
        definition.trust = trust;

        let name = definition.name.clone();
        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            warn!(tool_name = %name, "MCP tool already registered, ignoring duplicate");
            return;
        }
        tools.insert(
            name.clone(),
            RegisteredTool {
                definition,
                invoker: tool,
            },
        );
        debug!(tool_name = %name, server_id = %server_id, "MCP tool registered");
    }

    /// Registers every tool a server exposed, under the server prefix.
    ///
    /// Returns the registry-visible names that were added (duplicates are
    /// skipped with a warning, matching `register`).
    pub async fn register_mcp_tools_from_server(
        &self,
        server_id: &str,
        server_name: &str,
        trust: TrustLevel,
        tool_list: Vec<Arc<dyn Tool>>,
    ) -> Vec<String> {
        let prefix = Self::server_prefix(server_id);
        let mut registered = Vec::with_capacity(tool_list.len());

        let mut tools = self.tools.write().await;
        for tool in tool_list {
            let mut definition = tool.definition();
            if !definition.name.starts_with(&prefix) {
                definition.name = format!("{}{}", prefix, definition.name);
            }
            definition.source = ToolSource::Mcp {
                server_id: server_id.to_string(),
            };
            definition.trust = trust;

            let name = definition.name.clone();
            if tools.contains_key(&name) {
                warn!(
                    tool_name = %name,
                    server_name = %server_name,
                    "MCP tool already registered, ignoring duplicate"
                );
                continue;
            }
            tools.insert(
                name.clone(),
                RegisteredTool {
                    definition,
                    invoker: tool,
                },
            );
            registered.push(name);
        }
        drop(tools);

        info!(
            server_id = %server_id,
            server_name = %server_name,
            tools_count = registered.len(),
            "Registered MCP tools from server"
        );
        registered
    }

    /// Removes every tool carrying the server's prefix.
    ///
    /// Returns the number of tools removed.
    pub async fn unregister_mcp_tools_from_server(&self, server_id: &str) -> usize {
        let prefix = Self::server_prefix(server_id);
        let mut tools = self.tools.write().await;
        let before = tools.len();
        tools.retain(|name, _| !name.starts_with(&prefix));
        let removed = before - tools.len();
        drop(tools);

        info!(
            server_id = %server_id,
            removed = removed,
            "Unregistered MCP tools from server"
        );
        removed
    }

    /// Resolves a name to its registered tool.
    pub async fn get_tool(&self, name: &str) -> Option<RegisteredTool> {
        let tools = self.tools.read().await;
        tools.get(name).cloned()
    }

    /// Lists every registered tool's metadata. Insertion order is not
    /// observable; callers must not rely on ordering.
    pub async fn list_tools(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        tools.values().map(|t| t.definition.clone()).collect()
    }

    /// Number of registered tools.
    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    /// True when no tools are registered.
    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolError, ToolResult};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct FakeTool {
        name: String,
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.name.clone(),
                description: format!("fake tool {}", self.name),
                input_schema: json!({"type": "object"}),
                source: ToolSource::Builtin,
                trust: TrustLevel::Trusted,
            }
        }

        async fn execute(&self, _input: Value) -> ToolResult<Value> {
            Err(ToolError::ExecutionFailed("fake".to_string()))
        }
    }

    fn fake(name: &str) -> Arc<dyn Tool> {
        Arc::new(FakeTool {
            name: name.to_string(),
        })
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = ToolRegistry::new();
        registry.register(fake("echo")).await;

        let tool = registry.get_tool("echo").await.expect("tool expected");
        assert_eq!(tool.definition.name, "echo");
        assert!(registry.get_tool("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_noop() {
        let registry = ToolRegistry::new();
        registry.register(fake("echo")).await;
        registry.register(fake("echo")).await;
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_names_unique_after_register_unregister_sequence() {
        let registry = ToolRegistry::new();
        registry.register(fake("echo")).await;
        registry
            .register_mcp_tools_from_server(
                "0123456789abcdef",
                "files",
                TrustLevel::Moderate,
                vec![fake("read"), fake("write"), fake("read")],
            )
            .await;

        let names: Vec<String> = registry
            .list_tools()
            .await
            .into_iter()
            .map(|d| d.name)
            .collect();
        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len(), "names must be unique");
        assert_eq!(names.len(), 3); // echo + read + write (duplicate read skipped)
    }

    #[tokio::test]
    async fn test_mcp_prefix_shape() {
        let registry = ToolRegistry::new();
        let server_id = "a1b2c3d4e5f60718";
        registry
            .register_mcp_tools_from_server(server_id, "files", TrustLevel::Untrusted, vec![fake("read_file")])
            .await;

        let tools = registry.list_tools().await;
        let def = tools.iter().find(|d| d.source.is_mcp()).unwrap();
        assert_eq!(def.name, "mcp_a1b2c3d4_read_file");
        assert_eq!(def.trust, TrustLevel::Untrusted);
        assert!(def.name.starts_with(&ToolRegistry::server_prefix(server_id)));
    }

    #[tokio::test]
    async fn test_bulk_unregister_by_prefix() {
        let registry = ToolRegistry::new();
        registry.register(fake("echo")).await;
        registry
            .register_mcp_tools_from_server(
                "serverAAAAAAA",
                "a",
                TrustLevel::Moderate,
                vec![fake("one"), fake("two")],
            )
            .await;
        registry
            .register_mcp_tools_from_server(
                "serverBBBBBBB",
                "b",
                TrustLevel::Moderate,
                vec![fake("three")],
            )
            .await;
        assert_eq!(registry.len().await, 4);

        let removed = registry
            .unregister_mcp_tools_from_server("serverAAAAAAA")
            .await;
        assert_eq!(removed, 2);
        assert_eq!(registry.len().await, 2);

        // Builtin and the other server's tool survive
        assert!(registry.get_tool("echo").await.is_some());
        let prefix_b = ToolRegistry::server_prefix("serverBBBBBBB");
        assert!(registry
            .get_tool(&format!("{}three", prefix_b))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_short_server_id_prefix() {
        // Server ids shorter than the prefix length are used whole
        assert_eq!(ToolRegistry::server_prefix("abc"), "mcp_abc_");
    }
}
