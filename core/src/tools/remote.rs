use super::error::{ToolError, ToolResult};
use super::traits::Tool;
use crate::mcp::error::McpError;
use crate::mcp::index::IndexedTool;
use crate::mcp::manager::ClientManager;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// A remote endpoint's tool exposed through the local [`Tool`] trait
///
/// Calls go through the manager's index, so if the owning endpoint changes
/// the call follows it.
pub struct RemoteTool {
    manager: ClientManager,
    entry: IndexedTool,
}

impl RemoteTool {
    pub fn new(manager: ClientManager, entry: IndexedTool) -> Self {
        Self { manager, entry }
    }

    /// One adapter per tool currently in the manager's index
    pub fn all(manager: &ClientManager) -> Vec<Self> {
        manager
            .get_all_tools()
            .into_iter()
            .map(|entry| Self::new(manager.clone(), entry))
            .collect()
    }

    pub fn endpoint(&self) -> &str {
        &self.entry.endpoint
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> String {
        self.entry.tool.name.clone()
    }

    fn description(&self) -> String {
        self.entry.tool.description.clone().unwrap_or_default()
    }

    fn parameters(&self) -> Value {
        self.entry.tool.input_schema.clone()
    }

    /// Returns the `{content: [...]}` result so it can be relayed unchanged
    async fn call(&self, arguments: Value) -> ToolResult<Value> {
        debug!(target: "tool_registry", tool = %self.entry.tool.name, endpoint = %self.entry.endpoint, "Relaying remote tool call");
        let arguments = (!arguments.is_null()).then_some(arguments);
        let result = self
            .manager
            .call_tool(&self.entry.tool.name, arguments)
            .await
            .map_err(|e| match e {
                McpError::ToolNotFound(name) => ToolError::NotFound(name),
                other => ToolError::ExecutionFailed(other.to_string()),
            })?;

        serde_json::to_value(result)
            .map_err(|e| ToolError::Internal(format!("Failed to serialize result: {}", e)))
    }
}
