//! The interrupt: a typed control-flow value, not an error.
//!
//! Encodes "the engine has queued work that must complete externally before
//! this run can continue". The engine returns it inside `EngineOutcome`;
//! the lifecycle service dispatches on the variant. Never persisted.

use uuid::Uuid;

use crate::llm::{ChatMessage, TokenUsage};

/// One worker job created (or reused) by a spawn call this turn.
#[derive(Debug, Clone)]
pub struct SpawnedJob {
    pub job_id: Uuid,
    pub tool_call_id: String,
    pub task: String,
}

/// Why the engine suspended.
#[derive(Debug, Clone)]
pub enum Interrupt {
    /// One or more spawn calls this turn created pending worker jobs.
    WorkersPending { created: Vec<SpawnedJob> },
    /// A blocking wait on a specific, already-existing worker.
    WaitForWorker {
        job_id: Uuid,
        tool_call_id: String,
        message: String,
    },
}

impl Interrupt {
    /// Barrier entries for this interrupt, in spawn order.
    pub fn barrier_entries(&self) -> Vec<crate::model::BarrierEntry> {
        match self {
            Interrupt::WorkersPending { created } => created
                .iter()
                .map(|j| crate::model::BarrierEntry {
                    job_id: j.job_id,
                    tool_call_id: j.tool_call_id.clone(),
                })
                .collect(),
            Interrupt::WaitForWorker {
                job_id,
                tool_call_id,
                ..
            } => vec![crate::model::BarrierEntry {
                job_id: *job_id,
                tool_call_id: tool_call_id.clone(),
            }],
        }
    }

    pub fn job_ids(&self) -> Vec<Uuid> {
        match self {
            Interrupt::WorkersPending { created } => created.iter().map(|j| j.job_id).collect(),
            Interrupt::WaitForWorker { job_id, .. } => vec![*job_id],
        }
    }
}

/// Result of one engine invocation.
///
/// `messages` is the full history including everything produced this
/// invocation; the engine persists nothing — the caller diffs against the
/// input prefix and stores the new rows.
#[derive(Debug)]
pub struct EngineOutcome {
    pub messages: Vec<ChatMessage>,
    /// Accumulated usage; `None` when no model call reported any.
    pub usage: Option<TokenUsage>,
    /// `Some` means the run must suspend; `None` means completed.
    pub interrupt: Option<Interrupt>,
}

impl EngineOutcome {
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_some()
    }

    /// Content of the trailing assistant message, if any.
    pub fn final_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::llm::Role::Assistant && !m.content.trim().is_empty())
            .map(|m| m.content.as_str())
    }
}
