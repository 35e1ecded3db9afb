//! LLM integration: provider trait, wire types, and implementations.

mod openai_chat;
mod provider;
pub mod scripted;

pub use openai_chat::OpenAiChatProvider;
pub use provider::{
    ChatMessage, FinishReason, LlmProvider, Role, TokenUsage, ToolCall, ToolCompletionRequest,
    ToolCompletionResponse, ToolDefinition,
};
pub use scripted::ScriptedProvider;

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Create an LLM provider from configuration.
pub fn create_llm_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    tracing::info!(
        "Using OpenAI-compatible Chat Completions API at {}",
        config.base_url
    );
    Ok(Arc::new(OpenAiChatProvider::new(config.clone())?))
}
