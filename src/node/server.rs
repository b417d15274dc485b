//! Node daemon

use crate::common::{Error, LogicalServerState, NodeConfig, NodeRole, Result};
use crate::node::http::{create_router, startup_router, NodeState};
use crate::node::registry::{Capability, CapabilityRegistry};
use crate::node::startup::{start_node, NodeRuntime, StartupOptions, STARTUP_STRATEGIES};
use crate::protocol::{ChangeProcessor, NomadServer, TopologyProcessor};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Exposes the protocol state
struct ProtocolCapability {
    server: Arc<NomadServer>,
}

impl Capability for ProtocolCapability {
    fn name(&self) -> &str {
        "nomad"
    }

    fn describe(&self) -> Value {
        match self.server.discover() {
            Ok(state) => json!({
                "mode": state.mode,
                "current_version": state.current_version,
                "highest_version": state.highest_version,
                "mutative_message_count": state.mutative_message_count,
                "has_incomplete_change": state.has_incomplete_change(),
            }),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }
}

/// Exposes the topology in effect
struct TopologyCapability {
    processor: Arc<TopologyProcessor>,
}

impl Capability for TopologyCapability {
    fn name(&self) -> &str {
        "topology"
    }

    fn describe(&self) -> Value {
        match self.processor.runtime() {
            Ok(Some(cluster)) => json!({
                "activated": true,
                "cluster": cluster.name,
                "stripes": cluster.stripes.len(),
                "nodes": cluster.nodes().count(),
                "max_offheap_mb": self.processor.limits().max_offheap_mb,
            }),
            Ok(None) => json!({ "activated": false }),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }
}

pub fn logical_state_of(config: &NodeConfig) -> LogicalServerState {
    match config.role {
        NodeRole::Active => LogicalServerState::Active,
        NodeRole::Passive => LogicalServerState::Passive,
    }
}

pub struct NodeDaemon {
    options: StartupOptions,
}

impl NodeDaemon {
    pub fn new(options: StartupOptions) -> Self {
        Self { options }
    }

    pub async fn serve(self) -> Result<()> {
        let config = &self.options.config;
        tracing::info!("Starting node: {}", config.name);
        tracing::info!("  HTTP API: {}", config.bind_addr);
        tracing::info!("  Repository: {}", config.repository_dir.display());
        tracing::info!("  Role: {:?}", config.role);
        let config_name = config.name.clone();

        // answer STARTING while the change log is replayed
        let listener = TcpListener::bind(config.bind_addr).await?;
        let (loaded_tx, loaded_rx) = oneshot::channel::<()>();
        let warmup = tokio::spawn(async move {
            axum::serve(listener, startup_router(&config_name))
                .with_graceful_shutdown(async move {
                    let _ = loaded_rx.await;
                })
                .await
        });

        let options = self.options.clone();
        let loaded = tokio::task::spawn_blocking(move || start_node(STARTUP_STRATEGIES, &options))
            .await
            .map_err(|e| Error::Internal(format!("startup task failed: {}", e)));
        let _ = loaded_tx.send(());
        match warmup.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Startup listener failed: {}", e),
            Err(e) => tracing::warn!("Startup listener ended abnormally: {}", e),
        }
        let runtime = loaded??;
        tracing::info!("  Startup: {:?}", runtime.strategy);

        let listener = TcpListener::bind(config.bind_addr).await?;
        let (router, _registrations) = build_router(&runtime, logical_state_of(config))?;

        tracing::info!("✓ Node ready");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        tracing::info!("Node {} stopped", config.name);
        Ok(())
    }
}

/// Router plus the capability registrations it depends on; dropping the
/// registrations removes the capabilities
pub fn build_router(
    runtime: &NodeRuntime,
    logical_state: LogicalServerState,
) -> Result<(axum::Router, Vec<crate::node::registry::Registration>)> {
    let registry = CapabilityRegistry::new();
    let registrations = vec![
        registry.register(Arc::new(ProtocolCapability {
            server: runtime.server.clone(),
        }))?,
        registry.register(Arc::new(TopologyCapability {
            processor: runtime.processor.clone(),
        }))?,
    ];

    let router = create_router(NodeState {
        server: runtime.server.clone(),
        registry,
        logical_state,
    });
    Ok((router, registrations))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
