//! Threads and their ordered message history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::{ChatMessage, ToolCall};

/// A conversation thread. Exactly one supervisor thread exists per owner;
/// workers get disposable threads that never touch the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

/// Message role within a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// A persisted message. Ordering within a thread is by the monotonic
/// insertion `id`, never by timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: i64,
    pub thread_id: Uuid,
    pub role: Role,
    pub content: String,
    /// Tool call requests; assistant messages only.
    pub tool_calls: Option<Vec<ToolCall>>,
    /// The request this responds to; tool messages only.
    pub tool_call_id: Option<String>,
    /// Whether the engine has consumed this message.
    pub processed: bool,
    /// Excluded from user-visible history but included in LLM context.
    pub internal: bool,
    pub created_at: DateTime<Utc>,
}

impl ThreadMessage {
    /// Convert to the wire shape the LLM provider understands.
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role.into(),
            content: self.content.clone(),
            tool_call_id: self.tool_call_id.clone(),
            name: None,
            tool_calls: self.tool_calls.clone(),
        }
    }
}

/// Fields needed to append a message to a thread.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub thread_id: Uuid,
    pub role: Role,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    pub processed: bool,
    pub internal: bool,
}

impl NewMessage {
    pub fn user(thread_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            thread_id,
            role: Role::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            processed: false,
            internal: false,
        }
    }

    pub fn system(thread_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            thread_id,
            role: Role::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            processed: true,
            internal: true,
        }
    }

    /// Build a row from an engine-produced chat message.
    pub fn from_chat(thread_id: Uuid, msg: &ChatMessage) -> Self {
        Self {
            thread_id,
            role: msg.role.into(),
            content: msg.content.clone(),
            tool_calls: msg.tool_calls.clone(),
            tool_call_id: msg.tool_call_id.clone(),
            processed: true,
            internal: false,
        }
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

impl From<Role> for crate::llm::Role {
    fn from(role: Role) -> Self {
        match role {
            Role::System => crate::llm::Role::System,
            Role::User => crate::llm::Role::User,
            Role::Assistant => crate::llm::Role::Assistant,
            Role::Tool => crate::llm::Role::Tool,
        }
    }
}

impl From<crate::llm::Role> for Role {
    fn from(role: crate::llm::Role) -> Self {
        match role {
            crate::llm::Role::System => Role::System,
            crate::llm::Role::User => Role::User,
            crate::llm::Role::Assistant => Role::Assistant,
            crate::llm::Role::Tool => Role::Tool,
        }
    }
}
