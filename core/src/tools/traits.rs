use super::error::ToolResult;
use crate::mcp::types::Tool as ToolDefinition;
use async_trait::async_trait;
use serde_json::Value;

/// A capability the host executes in-process and can expose over the wire
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the tool is listed and invoked under
    fn name(&self) -> String;

    fn description(&self) -> String;

    /// JSON Schema of the arguments object
    fn parameters(&self) -> Value;

    async fn call(&self, arguments: Value) -> ToolResult<Value>;

    /// The record advertised in `tools/list`
    fn definition(&self) -> ToolDefinition {
        let description = self.description();
        ToolDefinition {
            name: self.name(),
            description: (!description.is_empty()).then_some(description),
            input_schema: self.parameters(),
        }
    }
}
