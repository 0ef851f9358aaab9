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

//! MCP bridge.
//!
//! Process-wide coordinator for external tool servers:
//! - connect/disconnect lifecycle with a graceful-disconnect grace window
//! - tool registration into the shared [`ToolRegistry`] under server prefixes
//! - tool invocation with per-server circuit breaker and bounded retry
//!
//! ## Grace window
//!
//! A graceful disconnect does not remove tools immediately; it schedules a
//! delayed-unregister task (default 5 s). A reconnect inside the window
//! cancels the timer, so a flapping server never causes tool churn. A tool
//! call inside the window against a server that is really gone fails with a
//! transient error that the executor's retry policy may redeem after
//! reconnect.

use crate::config::McpServerConfig;
use crate::events::{AgentEvent, EventEmitter, EventType};
use crate::mcp::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::mcp::client::MCPClient;
use crate::mcp::error::{MCPError, MCPResult};
use crate::mcp::protocol::{MCPToolCallResponse, MCPToolDefinition};
use crate::tools::{Tool, ToolDefinition, ToolError, ToolRegistry, ToolResult, ToolSource};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maximum retry attempts for transient MCP call errors.
const MCP_MAX_RETRY_ATTEMPTS: u32 = 2;

/// Initial retry delay in milliseconds (doubles with each attempt).
const MCP_INITIAL_RETRY_DELAY_MS: u64 = 500;

/// Session id used on bridge-level events that belong to no session.
const SYSTEM_SESSION: &str = "system";

/// Shared, process-wide MCP lifecycle coordinator.
pub struct MCPBridge {
    /// Connected clients keyed by server id
    clients: RwLock<HashMap<String, MCPClient>>,
    /// The shared tool catalog the bridge populates
    registry: Arc<ToolRegistry>,
    /// Event fan-out for connect/disconnect notices
    emitter: Arc<EventEmitter>,
    /// Pending delayed-unregister timers keyed by server id
    pending_unregister: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Per-server circuit breakers keyed by server id
    circuit_breakers: RwLock<HashMap<String, CircuitBreaker>>,
    /// Definition hashes per server for schema-change detection at reconnect
    tool_hashes: Mutex<HashMap<String, HashMap<String, u64>>>,
    /// Graceful-disconnect window in seconds
    grace_secs: f64,
}

impl MCPBridge {
    /// Creates a bridge registering tools into `registry`.
    pub fn new(registry: Arc<ToolRegistry>, emitter: Arc<EventEmitter>, grace_secs: f64) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            registry,
            emitter,
            pending_unregister: Mutex::new(HashMap::new()),
            circuit_breakers: RwLock::new(HashMap::new()),
            tool_hashes: Mutex::new(HashMap::new()),
            grace_secs: grace_secs.max(0.0),
        }
    }

    /// Connects a server and registers its tools.
    ///
    /// Cancels any pending-unregister timer for the server id first, so a
    /// reconnect inside the grace window leaves the registry untouched.
    /// Idempotent when the server is already connected.
    pub async fn connect_and_register(
        self: &Arc<Self>,
        config: McpServerConfig,
    ) -> MCPResult<usize> {
        self.cancel_pending_unregister(&config.id).await;

        {
            let clients = self.clients.read().await;
            if let Some(existing) = clients.get(&config.id) {
                debug!(
                    server_id = %config.id,
                    "Server already connected, connect_and_register is a no-op"
                );
                return Ok(existing.tools().len());
            }
        }

        let client = MCPClient::connect(config.clone()).await?;
        let definitions: Vec<MCPToolDefinition> = client.tools().to_vec();

        // Schema-change detection: a changed definition at reconnect drops
        // the stale registrations and re-prompts trust for the new shape.
        let new_hashes: HashMap<String, u64> = definitions
            .iter()
            .map(|d| (d.name.clone(), d.definition_hash()))
            .collect();
        let schema_changed = {
            let mut hashes = self.tool_hashes.lock().await;
            let changed = hashes
                .get(&config.id)
                .map(|old| old != &new_hashes)
                .unwrap_or(false);
            hashes.insert(config.id.clone(), new_hashes);
            changed
        };
        if schema_changed {
            warn!(
                server_id = %config.id,
                server_name = %config.name,
                "Tool definitions changed at reconnect, re-registering"
            );
            self.registry
                .unregister_mcp_tools_from_server(&config.id)
                .await;
            self.emitter.publish(AgentEvent::new(
                EventType::Message,
                SYSTEM_SESSION,
                serde_json::json!({
                    "content": format!(
                        "MCP server '{}' changed its tool definitions; trust must be reconfirmed",
                        config.name
                    ),
                    "server_id": config.id,
                }),
            ));
        }

        let proxies: Vec<Arc<dyn Tool>> = definitions
            .iter()
            .map(|definition| {
                Arc::new(McpProxyTool {
                    bridge: Arc::downgrade(self),
                    server_id: config.id.clone(),
                    server_name: config.name.clone(),
                    definition: definition.clone(),
                    trust: config.trust_level,
                }) as Arc<dyn Tool>
            })
            .collect();

        let registered = self
            .registry
            .register_mcp_tools_from_server(&config.id, &config.name, config.trust_level, proxies)
            .await;

        {
            let mut clients = self.clients.write().await;
            clients.insert(config.id.clone(), client);
        }
        {
            let mut breakers = self.circuit_breakers.write().await;
            breakers
                .entry(config.id.clone())
                .or_insert_with(|| CircuitBreaker::with_defaults(config.name.clone()));
        }

        info!(
            server_id = %config.id,
            server_name = %config.name,
            tools_registered = registered.len(),
            "MCP server connected and registered"
        );

        Ok(registered.len())
    }

    /// Disconnects a server.
    ///
    /// With `graceful` the tools stay registered for the grace window so a
    /// transient outage does not break in-flight plans; a reconnect inside
    /// the window cancels the removal. Without it, everything goes now.
    pub async fn disconnect_and_unregister(
        self: &Arc<Self>,
        server_id: &str,
        graceful: bool,
    ) -> MCPResult<()> {
        if !graceful {
            info!(server_id = %server_id, "Immediate MCP disconnect");
            self.cancel_pending_unregister(server_id).await;
            self.finish_disconnect(server_id).await;
            return Ok(());
        }

        let delay = Duration::from_secs_f64(self.grace_secs);
        info!(
            server_id = %server_id,
            grace_secs = self.grace_secs,
            "Graceful MCP disconnect, scheduling delayed unregister"
        );

        let bridge = Arc::downgrade(self);
        let id = server_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(bridge) = bridge.upgrade() else {
                return;
            };
            // Remove our own timer entry before tearing down
            {
                let mut pending = bridge.pending_unregister.lock().await;
                pending.remove(&id);
            }
            info!(server_id = %id, "Grace window elapsed, unregistering MCP tools");
            bridge.finish_disconnect(&id).await;
        });

        let mut pending = self.pending_unregister.lock().await;
        if let Some(previous) = pending.insert(server_id.to_string(), task) {
            // A fresh disconnect restarts the window
            previous.abort();
        }

        Ok(())
    }

    /// Explicitly cancels a pending delayed unregister (reconnect detection).
    ///
    /// Returns true when a timer was actually cancelled.
    pub async fn cancel_pending_unregister(&self, server_id: &str) -> bool {
        let mut pending = self.pending_unregister.lock().await;
        if let Some(task) = pending.remove(server_id) {
            task.abort();
            info!(server_id = %server_id, "Cancelled pending MCP unregister");
            true
        } else {
            false
        }
    }

    async fn finish_disconnect(&self, server_id: &str) {
        let client = {
            let mut clients = self.clients.write().await;
            clients.remove(server_id)
        };
        if let Some(mut client) = client {
            if let Err(e) = client.disconnect().await {
                warn!(server_id = %server_id, error = %e, "Error closing MCP transport");
            }
        }

        {
            let mut breakers = self.circuit_breakers.write().await;
            breakers.remove(server_id);
        }

        self.registry
            .unregister_mcp_tools_from_server(server_id)
            .await;
    }

    /// Connects every enabled persisted server in parallel.
    ///
    /// Per-server failures are logged and do not propagate; partial
    /// readiness is acceptable at startup.
    pub async fn initialize_mcp_tools(self: &Arc<Self>, servers: &[McpServerConfig]) {
        let enabled: Vec<&McpServerConfig> = servers.iter().filter(|s| s.enabled).collect();
        info!(server_count = enabled.len(), "Initializing MCP servers");

        let results = join_all(enabled.iter().map(|config| {
            let bridge = Arc::clone(self);
            let config = (*config).clone();
            async move {
                let id = config.id.clone();
                let name = config.name.clone();
                (id, name, bridge.connect_and_register(config).await)
            }
        }))
        .await;

        for (server_id, server_name, result) in results {
            match result {
                Ok(count) => {
                    info!(
                        server_id = %server_id,
                        server_name = %server_name,
                        tools_count = count,
                        "MCP server started"
                    );
                }
                Err(e) => {
                    warn!(
                        server_id = %server_id,
                        server_name = %server_name,
                        error = %e,
                        "Failed to start MCP server, continuing without it"
                    );
                }
            }
        }
    }

    /// Calls a tool on a connected server, with circuit breaker and bounded
    /// retry on transient errors.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> MCPResult<MCPToolCallResponse> {
        // Fail fast when the server has been failing
        {
            let mut breakers = self.circuit_breakers.write().await;
            if let Some(breaker) = breakers.get_mut(server_id) {
                if !breaker.allow_request() {
                    let remaining = breaker
                        .remaining_cooldown()
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    return Err(MCPError::CircuitBreakerOpen {
                        server: server_id.to_string(),
                        cooldown_remaining_secs: remaining,
                    });
                }
            }
        }

        let mut last_error: Option<MCPError> = None;

        for attempt in 0..=MCP_MAX_RETRY_ATTEMPTS {
            let result = {
                let mut clients = self.clients.write().await;
                let client = clients
                    .get_mut(server_id)
                    .ok_or(MCPError::ServerNotFound {
                        server: server_id.to_string(),
                    })?;
                client.call_tool(tool_name, arguments.clone()).await
            };

            match result {
                Ok(response) => {
                    let mut breakers = self.circuit_breakers.write().await;
                    if let Some(breaker) = breakers.get_mut(server_id) {
                        breaker.record_success();
                    }
                    if attempt > 0 {
                        info!(
                            server_id = %server_id,
                            tool_name = %tool_name,
                            attempt = attempt + 1,
                            "MCP tool call succeeded on retry"
                        );
                    }
                    return Ok(response);
                }
                Err(e) => {
                    let retryable = e.is_transient();

                    if !retryable || attempt >= MCP_MAX_RETRY_ATTEMPTS {
                        {
                            let mut breakers = self.circuit_breakers.write().await;
                            if let Some(breaker) = breakers.get_mut(server_id) {
                                breaker.record_failure();
                            }
                        }
                        if attempt > 0 {
                            return Err(MCPError::RetryExhausted {
                                server: server_id.to_string(),
                                attempts: attempt + 1,
                                last_error: e.to_string(),
                            });
                        }
                        return Err(e);
                    }

                    let delay_ms = MCP_INITIAL_RETRY_DELAY_MS * 2_u64.pow(attempt);
                    warn!(
                        server_id = %server_id,
                        tool_name = %tool_name,
                        attempt = attempt + 1,
                        delay_ms = delay_ms,
                        error = %e,
                        "Retrying MCP tool call after transient error"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| MCPError::IoError {
            context: "retry loop".to_string(),
            message: "no error recorded".to_string(),
        }))
    }

    /// Circuit breaker state for a server, if connected.
    pub async fn circuit_state(&self, server_id: &str) -> Option<CircuitState> {
        let breakers = self.circuit_breakers.read().await;
        breakers.get(server_id).map(|b| b.state())
    }

    /// Number of connected servers.
    pub async fn connected_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// True when a delayed unregister is pending for the server.
    pub async fn has_pending_unregister(&self, server_id: &str) -> bool {
        self.pending_unregister.lock().await.contains_key(server_id)
    }

    /// Disconnects every server and aborts pending timers.
    pub async fn shutdown(&self) {
        info!("Shutting down MCP bridge");

        {
            let mut pending = self.pending_unregister.lock().await;
            for (_, task) in pending.drain() {
                task.abort();
            }
        }

        let server_ids: Vec<String> = {
            let clients = self.clients.read().await;
            clients.keys().cloned().collect()
        };
        for server_id in server_ids {
            self.finish_disconnect(&server_id).await;
        }

        info!("MCP bridge shutdown complete");
    }
}

/// Registry-facing proxy for one remote tool.
///
/// Holds a weak bridge handle: the bridge owns the registry which owns the
/// proxies, so a strong reference here would leak the whole triangle.
struct McpProxyTool {
    bridge: Weak<MCPBridge>,
    server_id: String,
    server_name: String,
    definition: MCPToolDefinition,
    trust: crate::tools::TrustLevel,
}

#[async_trait]
impl Tool for McpProxyTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.definition.name.clone(),
            description: self.definition.description.clone(),
            input_schema: self.definition.input_schema.clone(),
            source: ToolSource::Mcp {
                server_id: self.server_id.clone(),
            },
            trust: self.trust,
        }
    }

    async fn execute(&self, input: Value) -> ToolResult<Value> {
        let Some(bridge) = self.bridge.upgrade() else {
            return Err(ToolError::Transport(format!(
                "MCP bridge is gone, cannot reach server '{}'",
                self.server_name
            )));
        };

        let response = bridge
            .call_tool(&self.server_id, &self.definition.name, input)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    ToolError::Transport(e.to_string())
                } else {
                    ToolError::ExecutionFailed(e.to_string())
                }
            })?;

        if response.is_error {
            return Err(ToolError::ExecutionFailed(response.text()));
        }

        Ok(serde_json::json!({
            "content": response.text(),
            "server": self.server_name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::TrustLevel;

    fn bridge_with(grace_secs: f64) -> (Arc<MCPBridge>, Arc<ToolRegistry>) {
        let registry = Arc::new(ToolRegistry::new());
        let emitter = Arc::new(EventEmitter::new());
        let bridge = Arc::new(MCPBridge::new(registry.clone(), emitter, grace_secs));
        (bridge, registry)
    }

    struct StubTool {
        name: String,
    }

    #[async_trait]
    impl Tool for StubTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.name.clone(),
                description: "stub".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
                source: ToolSource::Builtin,
                trust: TrustLevel::Moderate,
            }
        }

        async fn execute(&self, _input: Value) -> ToolResult<Value> {
            Ok(serde_json::json!({}))
        }
    }

    async fn seed_server_tools(registry: &ToolRegistry, server_id: &str, count: usize) {
        let tools: Vec<Arc<dyn Tool>> = (0..count)
            .map(|i| {
                Arc::new(StubTool {
                    name: format!("tool_{}", i),
                }) as Arc<dyn Tool>
            })
            .collect();
        registry
            .register_mcp_tools_from_server(server_id, "stub", TrustLevel::Moderate, tools)
            .await;
    }

    #[tokio::test]
    async fn test_graceful_disconnect_keeps_tools_during_window() {
        let (bridge, registry) = bridge_with(0.2);
        seed_server_tools(&registry, "srv_grace_1", 4).await;
        assert_eq!(registry.len().await, 4);

        bridge
            .disconnect_and_unregister("srv_grace_1", true)
            .await
            .unwrap();
        assert!(bridge.has_pending_unregister("srv_grace_1").await);

        // Still registered inside the window
        assert_eq!(registry.len().await, 4);

        // After the window, everything is gone
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.len().await, 0);
        assert!(!bridge.has_pending_unregister("srv_grace_1").await);
    }

    #[tokio::test]
    async fn test_cancel_pending_unregister_preserves_tools() {
        let (bridge, registry) = bridge_with(0.2);
        seed_server_tools(&registry, "srv_grace_2", 4).await;

        bridge
            .disconnect_and_unregister("srv_grace_2", true)
            .await
            .unwrap();
        assert!(bridge.cancel_pending_unregister("srv_grace_2").await);

        // Window would have elapsed; tools survive because the timer is gone
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.len().await, 4);

        // Cancelling again reports nothing pending
        assert!(!bridge.cancel_pending_unregister("srv_grace_2").await);
    }

    #[tokio::test]
    async fn test_immediate_disconnect_removes_tools_now() {
        let (bridge, registry) = bridge_with(5.0);
        seed_server_tools(&registry, "srv_now", 2).await;

        bridge
            .disconnect_and_unregister("srv_now", false)
            .await
            .unwrap();
        assert_eq!(registry.len().await, 0);
        assert!(!bridge.has_pending_unregister("srv_now").await);
    }

    #[tokio::test]
    async fn test_connect_cancels_pending_timer_even_on_failure() {
        let (bridge, registry) = bridge_with(0.2);
        seed_server_tools(&registry, "srv_flap", 4).await;

        bridge
            .disconnect_and_unregister("srv_flap", true)
            .await
            .unwrap();

        // Reconnect attempt for the same id: the timer is cancelled first,
        // even though the transport cannot actually be opened here.
        let config = McpServerConfig {
            id: "srv_flap".to_string(),
            name: "stub".to_string(),
            transport: crate::config::McpTransportKind::Stdio {
                command: "definitely-not-a-real-binary-4217".to_string(),
                args: vec![],
                env: Default::default(),
            },
            trust_level: TrustLevel::Moderate,
            enabled: true,
        };
        let result = bridge.connect_and_register(config).await;
        assert!(result.is_err());
        assert!(!bridge.has_pending_unregister("srv_flap").await);

        // No unregister fires; the 4 tools are still there
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.len().await, 4);
    }

    #[tokio::test]
    async fn test_call_tool_unknown_server() {
        let (bridge, _registry) = bridge_with(5.0);
        let err = bridge
            .call_tool("ghost", "tool", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MCPError::ServerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_timers_and_clears_registry() {
        let (bridge, registry) = bridge_with(60.0);
        seed_server_tools(&registry, "srv_a", 1).await;
        bridge
            .disconnect_and_unregister("srv_a", true)
            .await
            .unwrap();

        bridge.shutdown().await;
        assert!(!bridge.has_pending_unregister("srv_a").await);
        assert_eq!(bridge.connected_count().await, 0);
    }
}
