use crate::mcp::types::Tool as ToolDefinition;
use crate::tools::{ToolRegistry, ToolResult};
use async_trait::async_trait;
use serde_json::Value;

/// What a [`HostServer`](super::HostServer) serves: a tool listing and a way to run one
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn list_tools(&self) -> Vec<ToolDefinition>;

    /// Run a tool; the output is normalised into content blocks by the host
    async fn execute_tool(&self, name: &str, arguments: Value) -> ToolResult<Value>;
}

/// Serves whatever is registered in a [`ToolRegistry`]
#[derive(Clone, Default)]
pub struct RegistryProvider {
    registry: ToolRegistry,
}

impl RegistryProvider {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

#[async_trait]
impl CapabilityProvider for RegistryProvider {
    async fn list_tools(&self) -> Vec<ToolDefinition> {
        self.registry
            .list_tools()
            .iter()
            .map(|tool| tool.definition())
            .collect()
    }

    async fn execute_tool(&self, name: &str, arguments: Value) -> ToolResult<Value> {
        self.registry.call(name, arguments).await
    }
}
