// Copyright 2025 Assistance Micro Design
// SPDX-License-Identifier: Apache-2.0

//! MCP bridge lifecycle integration tests.
//!
//! A stdio "server" is faked with a shell one-liner that prints the
//! handshake and tool-list responses the client will read, which is enough
//! to exercise connect/disconnect and the graceful-unregister window
//! end-to-end without a real MCP server.

use soline_core::config::{McpServerConfig, McpTransportKind};
use soline_core::events::EventEmitter;
use soline_core::mcp::MCPBridge;
use soline_core::tools::{ToolRegistry, TrustLevel};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Shell script emitting an initialize response (id 1) and a 4-tool
/// tools/list response (id 2), then idling long enough to stay "alive".
const FAKE_SERVER_SCRIPT: &str = r#"printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","capabilities":{},"serverInfo":{"name":"fake-files","version":"1.0"}}}' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"read_file","description":"Reads a file","inputSchema":{"type":"object"}},{"name":"write_file","description":"Writes a file","inputSchema":{"type":"object"}},{"name":"list_dir","description":"Lists a directory","inputSchema":{"type":"object"}},{"name":"delete_file","description":"Deletes a file","inputSchema":{"type":"object"}}]}}'; sleep 5"#;

fn fake_server_config(server_id: &str) -> McpServerConfig {
    McpServerConfig {
        id: server_id.to_string(),
        name: "fake-files".to_string(),
        transport: McpTransportKind::Stdio {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), FAKE_SERVER_SCRIPT.to_string()],
            env: HashMap::new(),
        },
        trust_level: TrustLevel::Moderate,
        enabled: true,
    }
}

fn bridge_with_grace(grace_secs: f64) -> (Arc<MCPBridge>, Arc<ToolRegistry>) {
    let registry = Arc::new(ToolRegistry::new());
    let emitter = Arc::new(EventEmitter::new());
    let bridge = Arc::new(MCPBridge::new(registry.clone(), emitter, grace_secs));
    (bridge, registry)
}

#[tokio::test]
async fn test_connect_registers_prefixed_tools() {
    let (bridge, registry) = bridge_with_grace(5.0);
    let server_id = "a1b2c3d4e5f6a7b8";

    let count = bridge
        .connect_and_register(fake_server_config(server_id))
        .await
        .expect("connect should succeed");
    assert_eq!(count, 4);
    assert_eq!(bridge.connected_count().await, 1);

    let names: Vec<String> = registry
        .list_tools()
        .await
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names.len(), 4);
    for name in &names {
        assert!(
            name.starts_with("mcp_a1b2c3d4_"),
            "MCP tool '{}' must carry the server prefix",
            name
        );
    }
    assert!(names.contains(&"mcp_a1b2c3d4_read_file".to_string()));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let (bridge, registry) = bridge_with_grace(5.0);
    let config = fake_server_config("idempotent-server");

    let first = bridge
        .connect_and_register(config.clone())
        .await
        .expect("first connect");
    let second = bridge
        .connect_and_register(config)
        .await
        .expect("second connect");

    assert_eq!(first, 4);
    assert_eq!(second, 4);
    assert_eq!(registry.len().await, 4, "no duplicate registrations");
    assert_eq!(bridge.connected_count().await, 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_grace_reconnect_keeps_tools_registered() {
    // Window comfortably larger than the reconnect delay
    let (bridge, registry) = bridge_with_grace(1.0);
    let config = fake_server_config("grace-server-01");

    bridge
        .connect_and_register(config.clone())
        .await
        .expect("connect");
    assert_eq!(registry.len().await, 4);

    // Graceful disconnect: tools must survive the window
    bridge
        .disconnect_and_unregister(&config.id, true)
        .await
        .expect("graceful disconnect");
    assert!(bridge.has_pending_unregister(&config.id).await);
    assert_eq!(registry.len().await, 4, "tools stay during the grace window");

    // Reconnect well inside the window
    tokio::time::sleep(Duration::from_millis(300)).await;
    bridge
        .connect_and_register(config.clone())
        .await
        .expect("reconnect");

    // The pending unregister was cancelled by the reconnect
    assert!(!bridge.has_pending_unregister(&config.id).await);

    // Even after the original window would have fired, nothing flapped
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(registry.len().await, 4, "no tool was removed");
    let names: Vec<String> = registry
        .list_tools()
        .await
        .into_iter()
        .map(|d| d.name)
        .collect();
    let mut deduped = names.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(names.len(), deduped.len(), "no tool was duplicated");

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_grace_expiry_unregisters() {
    let (bridge, registry) = bridge_with_grace(0.3);
    let config = fake_server_config("grace-server-02");

    bridge
        .connect_and_register(config.clone())
        .await
        .expect("connect");
    bridge
        .disconnect_and_unregister(&config.id, true)
        .await
        .expect("graceful disconnect");

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(registry.len().await, 0, "tools removed after the window");
    assert_eq!(bridge.connected_count().await, 0);
}

#[tokio::test]
async fn test_non_graceful_disconnect_is_immediate() {
    let (bridge, registry) = bridge_with_grace(5.0);
    let config = fake_server_config("abrupt-server-1");

    bridge
        .connect_and_register(config.clone())
        .await
        .expect("connect");
    bridge
        .disconnect_and_unregister(&config.id, false)
        .await
        .expect("disconnect");

    assert_eq!(registry.len().await, 0);
    assert_eq!(bridge.connected_count().await, 0);
    assert!(!bridge.has_pending_unregister(&config.id).await);
}

#[tokio::test]
async fn test_initialize_mcp_tools_tolerates_failures() {
    let (bridge, registry) = bridge_with_grace(5.0);

    let good = fake_server_config("startup-good-01");
    let broken = McpServerConfig {
        id: "startup-broken".to_string(),
        name: "broken".to_string(),
        transport: McpTransportKind::Stdio {
            command: "definitely-not-a-real-binary-4217".to_string(),
            args: vec![],
            env: HashMap::new(),
        },
        trust_level: TrustLevel::Moderate,
        enabled: true,
    };
    let disabled = McpServerConfig {
        enabled: false,
        ..fake_server_config("startup-disabled")
    };

    bridge
        .initialize_mcp_tools(&[good, broken, disabled])
        .await;

    // Partial readiness: the good server's tools are there, the broken one
    // was logged and skipped, the disabled one never attempted
    assert_eq!(bridge.connected_count().await, 1);
    assert_eq!(registry.len().await, 4);

    bridge.shutdown().await;
}
