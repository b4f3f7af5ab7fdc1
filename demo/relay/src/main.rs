use std::collections::HashSet;
use std::sync::Arc;

use tether_core::mcp::config::MemoryConfigStore;
use tether_core::mcp::types::ServerInfo;
use tether_core::tools::{RemoteTool, ToolRegistry};
use tether_core::{ClientManager, HostServer, RegistryProvider, TetherConfig, Tool};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// Make the registry mirror the manager's current tool index
async fn sync_registry(manager: &ClientManager, registry: &ToolRegistry) {
    let remote = RemoteTool::all(manager);
    let keep: HashSet<String> = remote.iter().map(|t| t.name()).collect();

    for stale in registry
        .list_tools()
        .iter()
        .map(|t| t.name())
        .filter(|name| !keep.contains(name))
    {
        registry.unregister(&stale);
    }
    for tool in remote {
        registry.register(Arc::new(tool)).await;
    }
    info!(target: "tether_relay", tools = registry.len(), "Relayed tool set updated");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries protocol frames, so logs go to stderr
    tether_core::telemetry::init_logging("tether-relay")
        .map_err(|e| e as Box<dyn std::error::Error>)?;

    // Load configuration (defaults + env + optional TOML overlay)
    let cfg = TetherConfig::load();
    if cfg.endpoints.is_empty() {
        warn!(target: "tether_relay", "No endpoints configured; relaying nothing");
    }

    let store = Arc::new(MemoryConfigStore::with_endpoints(cfg.endpoints.clone()));
    let manager = ClientManager::new(store, cfg.manager_options());

    let report = manager.start().await;
    for (id, reason) in &report.failed {
        warn!(target: "tether_relay", endpoint = %id, reason = %reason, "Endpoint unavailable");
    }
    for (id, reason) in &report.skipped {
        warn!(target: "tether_relay", endpoint = %id, reason = %reason, "Endpoint skipped");
    }
    info!(
        target: "tether_relay",
        connected = report.connected.len(),
        tools = manager.tool_index().len(),
        "Endpoints started"
    );

    let registry = ToolRegistry::new();
    sync_registry(&manager, &registry).await;

    // Follow reconnects and list changes
    let mut status_rx = manager.subscribe_status();
    let sync_task = {
        let manager = manager.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            loop {
                match status_rx.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => sync_registry(&manager, &registry).await,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let host = HostServer::new(
        Arc::new(RegistryProvider::new(registry)),
        ServerInfo {
            name: cfg.client_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    )
    .with_instructions("Tools from every connected endpoint, one name each.");

    tokio::select! {
        served = host.serve_stdio() => {
            if let Err(e) = served {
                error!(target: "tether_relay", error = %e, "Host responder failed");
            }
        }
        _ = signal::ctrl_c() => {
            info!(target: "tether_relay", "Interrupted");
        }
    }

    sync_task.abort();
    manager.shutdown().await;
    info!(target: "tether_relay", "Relay stopped");
    Ok(())
}
