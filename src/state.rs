// Copyright 2025 Zileo-Chat-3 Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-scoped service wiring.
//!
//! Every shared service is constructed once here and handed to components
//! through constructors; there are no global singletons. The UI holds a
//! `CoreState` and interacts through the executor (`submit`, `cancel`), the
//! approval manager (`resolve`) and read-only trace queries.

use crate::approval::ApprovalManager;
use crate::config::CoreConfig;
use crate::events::EventEmitter;
use crate::executor::Executor;
use crate::llm::{DemoGateway, Gateway};
use crate::mcp::MCPBridge;
use crate::planner::Planner;
use crate::tools::builtin::{ChatTool, EchoTool};
use crate::tools::ToolRegistry;
use crate::trace::TraceStore;
use std::sync::Arc;
use tracing::info;

/// The wired-up agent execution core.
pub struct CoreState {
    /// Process configuration
    pub config: CoreConfig,
    /// Trace persistence
    pub trace: Arc<TraceStore>,
    /// Tool catalog
    pub registry: Arc<ToolRegistry>,
    /// Event fan-out
    pub emitter: Arc<EventEmitter>,
    /// Approval gate
    pub approval: Arc<ApprovalManager>,
    /// MCP server lifecycle coordinator
    pub bridge: Arc<MCPBridge>,
    /// LLM gateway
    pub gateway: Arc<dyn Gateway>,
    /// Session runner
    pub executor: Arc<Executor>,
}

impl CoreState {
    /// Initializes the core with the demo gateway (offline-capable default).
    pub async fn new(config: CoreConfig) -> anyhow::Result<Self> {
        Self::with_gateway(config, Arc::new(DemoGateway::new())).await
    }

    /// Initializes the core against a specific gateway.
    pub async fn with_gateway(
        config: CoreConfig,
        gateway: Arc<dyn Gateway>,
    ) -> anyhow::Result<Self> {
        let trace = Arc::new(
            TraceStore::new(&config.trace_db_path(), config.raw_io_truncate_bytes).await?,
        );
        trace
            .set_config_value("retention_days", &config.trace_retention_days.to_string())
            .await?;
        let purged = trace.cleanup_old_traces(config.trace_retention_days).await?;
        if purged > 0 {
            info!(purged = purged, "Expired trace entries removed at startup");
        }

        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(EchoTool)).await;
        registry
            .register(Arc::new(ChatTool::new(gateway.clone())))
            .await;

        let emitter = Arc::new(EventEmitter::new());
        let approval = Arc::new(ApprovalManager::new(emitter.clone()));
        let bridge = Arc::new(MCPBridge::new(
            registry.clone(),
            emitter.clone(),
            config.grace_unregister_secs,
        ));
        let planner = Arc::new(Planner::new(
            gateway.clone(),
            registry.clone(),
            emitter.clone(),
        ));
        let executor = Arc::new(Executor::new(
            registry.clone(),
            emitter.clone(),
            approval.clone(),
            trace.clone(),
            planner,
            gateway.clone(),
            config.clone(),
        ));

        // Connect persisted servers; per-server failures are non-fatal
        bridge.initialize_mcp_tools(&config.mcp_servers).await;

        info!(
            tools = registry.len().await,
            mcp_servers = bridge.connected_count().await,
            "Core state initialized"
        );

        Ok(Self {
            config,
            trace,
            registry,
            emitter,
            approval,
            bridge,
            gateway,
            executor,
        })
    }

    /// Graceful teardown: disconnect MCP servers and drop timers.
    pub async fn shutdown(&self) {
        self.bridge.shutdown().await;
        info!("Core state shut down");
    }
}
