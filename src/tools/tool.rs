//! Tool trait and types.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::artifacts::{ArtifactStore, ToolOutputStore};
use crate::context::RunContext;
use crate::store::Store;

/// A control-flow signal raised from inside a tool: the engine must suspend
/// because the work completes externally. Not a failure.
#[derive(Debug, Clone)]
pub enum Suspension {
    /// A spawn call created (or found) a non-terminal worker job.
    WorkerSpawned {
        job_id: Uuid,
        tool_call_id: String,
        task: String,
    },
    /// A blocking wait on a worker that has not finished yet.
    WaitForWorker {
        job_id: Uuid,
        tool_call_id: String,
        message: String,
    },
}

/// Error type for tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Tool not found: {0}")]
    NotFound(String),

    /// Configuration/setup failure the model cannot correct (missing
    /// credentials, unreachable host). The engine fails fast on these.
    #[error("Critical error: {0}")]
    Critical(String),

    /// Not an error: the engine must suspend. See `Suspension`.
    #[error("Execution suspended")]
    Suspend(Suspension),

    #[error(transparent)]
    Store(#[from] crate::error::StoreError),

    #[error(transparent)]
    Artifact(#[from] crate::error::ArtifactError),
}

/// Output from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// The result data; strings pass through, structures are JSON-encoded
    /// by the engine when building the tool message.
    pub result: serde_json::Value,
}

impl ToolOutput {
    pub fn json(result: serde_json::Value) -> Self {
        Self { result }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
        }
    }

    /// Render as tool-message content.
    pub fn into_content(self) -> String {
        match self.result {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        }
    }
}

/// Everything a tool may need beyond its arguments: run identity and the
/// shared stores. Passed explicitly; tools hold no global state.
#[derive(Clone)]
pub struct ToolContext {
    pub run: RunContext,
    pub store: Arc<dyn Store>,
    pub artifacts: Arc<ArtifactStore>,
    pub outputs: Arc<ToolOutputStore>,
    /// Current tool call id, set by the dispatcher before each invocation.
    pub tool_call_id: String,
}

/// Trait for tools the agent can call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    /// Tool definition for LLM binding.
    fn definition(&self) -> crate::llm::ToolDefinition {
        crate::llm::ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Extract a required string argument.
pub fn require_str<'a>(
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{}' parameter", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_into_content() {
        assert_eq!(ToolOutput::text("plain").into_content(), "plain");
        let json = ToolOutput::json(serde_json::json!({"a": 1}));
        assert_eq!(json.into_content(), r#"{"a":1}"#);
    }

    #[test]
    fn test_require_str() {
        let params = serde_json::json!({"task": "check disks"});
        assert_eq!(require_str(&params, "task").unwrap(), "check disks");
        assert!(require_str(&params, "missing").is_err());
    }
}
