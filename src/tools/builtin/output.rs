//! Dereference offloaded tool outputs.

use async_trait::async_trait;

use crate::artifacts::truncate_head_tail;
use crate::tools::tool::{require_str, Tool, ToolContext, ToolError, ToolOutput};

const DEFAULT_MAX_BYTES: usize = 32_000;
const HEAD_SIZE: usize = 1024;

/// Fetch an out-of-band tool output by artifact id, with head-tail
/// truncation so a huge blob cannot blow the context budget.
pub struct GetToolOutputTool;

#[async_trait]
impl Tool for GetToolOutputTool {
    fn name(&self) -> &str {
        "get_tool_output"
    }

    fn description(&self) -> &str {
        "Fetch the full content behind a [TOOL_OUTPUT:artifact_id=...] marker. \
         Long content is truncated head+tail with a byte-count marker."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "artifact_id": {
                    "type": "string",
                    "description": "Artifact id from the marker"
                },
                "max_bytes": {
                    "type": "integer",
                    "description": "Truncation budget in bytes (default 32000)"
                }
            },
            "required": ["artifact_id"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let artifact_id = require_str(&params, "artifact_id")?;
        let max_bytes = params
            .get("max_bytes")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_BYTES);

        match ctx.outputs.get(artifact_id).await {
            Ok(content) => Ok(ToolOutput::text(truncate_head_tail(
                &content, max_bytes, HEAD_SIZE,
            ))),
            Err(crate::error::ArtifactError::NotFound(_)) => Ok(ToolOutput::text(format!(
                "Error: tool output artifact '{}' not found",
                artifact_id
            ))),
            Err(e) => Err(e.into()),
        }
    }
}
