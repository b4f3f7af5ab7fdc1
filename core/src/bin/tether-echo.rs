//! Minimal stdio endpoint used by the integration tests and for manual checks.
//!
//! Environment:
//! - `TETHER_ECHO_NAME`: server name announced in `initialize` (default `tether-echo`)
//! - `TETHER_ECHO_TOOLS`: comma separated echo tool names (default `echo`)
//! - `TETHER_ECHO_START_DELAY_MS`: sleep before serving, to simulate slow start-up
//!
//! Besides the echo tools it always offers `whoami`, `slow` (sleeps `ms`),
//! `fail` (returns a tool error) and `crash` (exits the process).
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tether_core::mcp::types::ServerInfo;
use tether_core::tools::{Tool, ToolError, ToolRegistry, ToolResult};
use tether_core::{HostServer, RegistryProvider};

struct Echo {
    name: String,
}

#[async_trait]
impl Tool for Echo {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        "Return the `text` argument unchanged".to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"text": {"type": "string"}}})
    }

    async fn call(&self, arguments: Value) -> ToolResult<Value> {
        Ok(arguments.get("text").cloned().unwrap_or_else(|| json!("")))
    }
}

struct WhoAmI {
    server: String,
}

#[async_trait]
impl Tool for WhoAmI {
    fn name(&self) -> String {
        "whoami".to_string()
    }

    fn description(&self) -> String {
        "Name of this server".to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    async fn call(&self, _arguments: Value) -> ToolResult<Value> {
        Ok(json!(self.server))
    }
}

struct Slow;

#[async_trait]
impl Tool for Slow {
    fn name(&self) -> String {
        "slow".to_string()
    }

    fn description(&self) -> String {
        "Sleep for `ms` milliseconds, then answer".to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"ms": {"type": "integer"}}})
    }

    async fn call(&self, arguments: Value) -> ToolResult<Value> {
        let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(1_000);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!(format!("slept {ms}ms")))
    }
}

struct Fail;

#[async_trait]
impl Tool for Fail {
    fn name(&self) -> String {
        "fail".to_string()
    }

    fn description(&self) -> String {
        "Always fails".to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    async fn call(&self, _arguments: Value) -> ToolResult<Value> {
        Err(ToolError::ExecutionFailed("requested failure".to_string()))
    }
}

struct Crash;

#[async_trait]
impl Tool for Crash {
    fn name(&self) -> String {
        "crash".to_string()
    }

    fn description(&self) -> String {
        "Terminate the server process".to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    async fn call(&self, _arguments: Value) -> ToolResult<Value> {
        tracing::warn!(target: "mcp_host", "Crash requested, exiting");
        std::process::exit(3);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tether_core::telemetry::init_logging("tether-echo").ok();

    let server = std::env::var("TETHER_ECHO_NAME").unwrap_or_else(|_| "tether-echo".to_string());
    let names = std::env::var("TETHER_ECHO_TOOLS").unwrap_or_else(|_| "echo".to_string());
    let delay_ms = std::env::var("TETHER_ECHO_START_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    let registry = ToolRegistry::new();
    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        registry
            .register(Arc::new(Echo {
                name: name.to_string(),
            }))
            .await;
    }
    registry
        .register(Arc::new(WhoAmI {
            server: server.clone(),
        }))
        .await;
    registry.register(Arc::new(Slow)).await;
    registry.register(Arc::new(Fail)).await;
    registry.register(Arc::new(Crash)).await;

    let host = HostServer::new(
        Arc::new(RegistryProvider::new(registry)),
        ServerInfo {
            name: server,
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    );
    host.serve_stdio().await?;
    Ok(())
}
