//! Tool discovery for lazy loading.

use std::sync::Arc;

use async_trait::async_trait;

use crate::tools::registry::{ToolRegistry, CORE_TOOLS};
use crate::tools::tool::{require_str, Tool, ToolContext, ToolError, ToolOutput};

/// Maximum tools returned (and therefore loaded) per search.
pub const MAX_TOOLS_FROM_SEARCH: usize = 8;

/// Search the tool catalog by keyword. The engine parses the returned names
/// and binds them before the next model call, so discovered tools are
/// immediately callable.
pub struct SearchToolsTool {
    registry: Arc<ToolRegistry>,
}

impl SearchToolsTool {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for SearchToolsTool {
    fn name(&self) -> &str {
        "search_tools"
    }

    fn description(&self) -> &str {
        "Search the tool catalog with a query describing what you need. \
         Matching tools become available on your next turn."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What capability you are looking for"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let query = require_str(&params, "query")?.to_lowercase();
        let terms: Vec<&str> = query.split_whitespace().collect();

        let mut scored: Vec<(usize, serde_json::Value)> = Vec::new();
        for def in self.registry.definitions() {
            if CORE_TOOLS.contains(&def.name.as_str()) {
                continue;
            }
            let haystack = format!("{} {}", def.name, def.description).to_lowercase();
            let score = terms.iter().filter(|t| haystack.contains(**t)).count();
            if score > 0 {
                scored.push((
                    score,
                    serde_json::json!({
                        "name": def.name,
                        "description": def.description,
                    }),
                ));
            }
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let tools: Vec<serde_json::Value> = scored
            .into_iter()
            .take(MAX_TOOLS_FROM_SEARCH)
            .map(|(_, v)| v)
            .collect();

        Ok(ToolOutput::json(serde_json::json!({ "tools": tools })))
    }
}
