//! Scripted provider for tests: replays a fixed sequence of responses.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::provider::{
    FinishReason, LlmProvider, TokenUsage, ToolCall, ToolCompletionRequest, ToolCompletionResponse,
};

/// Replays a queue of canned responses, one per completion call.
///
/// When the script runs dry it returns a plain "(script exhausted)" text
/// response so a runaway loop terminates instead of erroring.
pub struct ScriptedProvider {
    script: Mutex<std::collections::VecDeque<ToolCompletionResponse>>,
    requests: Mutex<Vec<ToolCompletionRequest>>,
    delay: Option<std::time::Duration>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ToolCompletionResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep before each response, to exercise timeout paths.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// A final text response with token usage attached.
    pub fn text(content: impl Into<String>) -> ToolCompletionResponse {
        ToolCompletionResponse {
            content: Some(content.into()),
            tool_calls: vec![],
            finish_reason: FinishReason::Stop,
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                reasoning_tokens: 0,
            }),
        }
    }

    /// A response requesting the given tool calls.
    pub fn calls(calls: Vec<ToolCall>) -> ToolCompletionResponse {
        ToolCompletionResponse {
            content: None,
            tool_calls: calls,
            finish_reason: FinishReason::ToolUse,
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                reasoning_tokens: 0,
            }),
        }
    }

    /// A response with neither text nor tool calls.
    pub fn empty() -> ToolCompletionResponse {
        ToolCompletionResponse {
            content: Some(String::new()),
            tool_calls: vec![],
            finish_reason: FinishReason::Stop,
            usage: None,
        }
    }

    pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    /// Requests observed so far, for assertions on bound tools or messages.
    pub fn seen_requests(&self) -> Vec<ToolCompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of scripted responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete_with_tools(
        &self,
        req: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.requests.lock().unwrap().push(req);

        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| ToolCompletionResponse {
            content: Some("(script exhausted)".to_string()),
            tool_calls: vec![],
            finish_reason: FinishReason::Stop,
            usage: None,
        }))
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}
