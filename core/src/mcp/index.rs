use super::types::Tool;
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

/// One tool and the endpoint that serves it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedTool {
    pub endpoint: String,
    pub tool: Tool,
}

/// A name offered by more than one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub name: String,
    pub kept: String,
    pub ignored: String,
}

/// Global tool name -> owning endpoint map.
///
/// Always rebuilt from scratch; the first endpoint to register a name keeps
/// it and later duplicates are logged and ignored.
#[derive(Debug, Clone, Default)]
pub struct ToolIndex {
    tools: Vec<IndexedTool>,
    by_name: HashMap<String, usize>,
    collisions: Vec<Collision>,
}

impl ToolIndex {
    /// Build from `(endpoint, tools)` pairs given in registration order
    pub fn build<'a, I>(sources: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [Tool])>,
    {
        let mut index = Self::default();
        for (endpoint, tools) in sources {
            for tool in tools {
                if let Some(&existing) = index.by_name.get(&tool.name) {
                    let kept = index.tools[existing].endpoint.clone();
                    warn!(
                        target: "mcp_manager",
                        tool = %tool.name,
                        kept = %kept,
                        ignored = %endpoint,
                        "Duplicate tool name, keeping first registrant"
                    );
                    index.collisions.push(Collision {
                        name: tool.name.clone(),
                        kept,
                        ignored: endpoint.to_string(),
                    });
                    continue;
                }
                index.by_name.insert(tool.name.clone(), index.tools.len());
                index.tools.push(IndexedTool {
                    endpoint: endpoint.to_string(),
                    tool: tool.clone(),
                });
            }
        }
        index
    }

    pub fn owner(&self, name: &str) -> Option<&str> {
        self.get(name).map(|entry| entry.endpoint.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&IndexedTool> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    /// Every indexed tool in registration order
    pub fn tools(&self) -> &[IndexedTool] {
        &self.tools
    }

    pub fn collisions(&self) -> &[Collision] {
        &self.collisions
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
