use super::error::{ToolError, ToolResult};
use super::traits::Tool;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Local tools keyed by name, invoked with a per-call timeout
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<DashMap<String, Arc<dyn Tool>>>,
    call_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TOOL_TIMEOUT)
    }

    pub fn with_timeout(call_timeout: Duration) -> Self {
        Self {
            tools: Arc::new(DashMap::new()),
            call_timeout,
        }
    }

    /// Register a tool, replacing any previous tool with the same name
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        info!(target: "tool_registry", tool = %name, "Registering tool");
        if self.tools.insert(name.clone(), tool).is_some() {
            debug!(target: "tool_registry", tool = %name, "Replaced existing tool");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| t.clone())
    }

    /// All tools, sorted by name so listings are stable
    pub fn list_tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = self.tools.iter().map(|t| t.clone()).collect();
        tools.sort_by_key(|t| t.name());
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Call a tool by name with timeout
    #[tracing::instrument(skip(self, arguments), fields(tool.name = %name))]
    pub async fn call(&self, name: &str, arguments: serde_json::Value) -> ToolResult<serde_json::Value> {
        let started = Instant::now();

        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        debug!(target: "tool_registry", tool = %name, "Invoking tool");

        let result = match timeout(self.call_timeout, tool.call(arguments)).await {
            Ok(res) => res,
            Err(_) => {
                warn!(target: "tool_registry", tool = %name, "Tool execution timed out");
                Err(ToolError::Timeout(self.call_timeout))
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => debug!(target: "tool_registry", tool = %name, elapsed_ms, "Tool finished"),
            Err(e) => warn!(target: "tool_registry", tool = %name, error = %e, elapsed_ms, "Tool execution failed"),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> String {
            "upper".to_string()
        }

        fn description(&self) -> String {
            "Uppercase a string".to_string()
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }

        async fn call(&self, arguments: Value) -> ToolResult<Value> {
            let text = arguments["text"]
                .as_str()
                .ok_or_else(|| ToolError::InvalidArguments("Missing 'text' argument".to_string()))?;
            Ok(json!(text.to_uppercase()))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> String {
            "sleepy".to_string()
        }

        fn description(&self) -> String {
            String::new()
        }

        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }

        async fn call(&self, _arguments: Value) -> ToolResult<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Upper)).await;

        assert_eq!(registry.call("upper", json!({"text": "hi"})).await.unwrap(), json!("HI"));
        assert!(matches!(
            registry.call("upper", json!({})).await,
            Err(ToolError::InvalidArguments(_))
        ));
        assert!(matches!(
            registry.call("missing", json!({})).await,
            Err(ToolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let registry = ToolRegistry::with_timeout(Duration::from_millis(20));
        registry.register(Arc::new(Sleepy)).await;
        assert!(matches!(
            registry.call("sleepy", json!({})).await,
            Err(ToolError::Timeout(_))
        ));
    }

    #[test]
    fn test_definition_omits_empty_description() {
        let definition = Sleepy.definition();
        assert_eq!(definition.name, "sleepy");
        assert!(definition.description.is_none());
        assert_eq!(Upper.definition().description.as_deref(), Some("Uppercase a string"));
    }
}
