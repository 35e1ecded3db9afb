//! Request-scoped run identity, threaded explicitly through the engine and
//! every tool invocation. No hidden global state.

use uuid::Uuid;

/// Identity and model configuration for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub owner_id: String,
    pub thread_id: Uuid,
    /// End-to-end debugging identifier; propagated into worker jobs.
    pub trace_id: Uuid,
    /// Stable id clients use to correlate streamed chunks with the final
    /// assistant message.
    pub message_id: Uuid,
    pub model: String,
    pub reasoning_effort: Option<String>,
}

impl RunContext {
    /// Derive a worker-run context from a supervisor context; the worker
    /// inherits model and reasoning effort unless overridden at spawn.
    pub fn for_worker(&self, run_id: Uuid, model_override: Option<&str>) -> Self {
        Self {
            run_id,
            owner_id: self.owner_id.clone(),
            thread_id: self.thread_id,
            trace_id: self.trace_id,
            message_id: Uuid::new_v4(),
            model: model_override.map(String::from).unwrap_or_else(|| self.model.clone()),
            reasoning_effort: self.reasoning_effort.clone(),
        }
    }
}
