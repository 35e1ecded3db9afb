//! Run records: one execution of the supervisor on its thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a run.
///
/// `Queued`, `Running` and `Waiting` can transition forward; `Success`,
/// `Failed` and `Cancelled` are terminal. `Deferred` is terminal for the
/// *request* (the client detached) while the underlying work continues and
/// finishes the run through a continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Waiting,
    Deferred,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether no further status transitions are expected on this row.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Deferred
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Deferred => "deferred",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "waiting" => Some(RunStatus::Waiting),
            "deferred" => Some(RunStatus::Deferred),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// A user turn arriving through the ingress API.
    Api,
    /// A continuation run chained from a terminal run to process a worker
    /// result that arrived late.
    Continuation,
}

impl RunTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RunTrigger::Api => "api",
            RunTrigger::Continuation => "continuation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api" => Some(RunTrigger::Api),
            "continuation" => Some(RunTrigger::Continuation),
            _ => None,
        }
    }
}

/// One execution of the supervisor agent on a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub owner_id: String,
    pub thread_id: Uuid,
    pub status: RunStatus,
    pub trigger: RunTrigger,
    /// Stable message id used by clients to correlate streamed chunks with
    /// the final assistant message. Survives interrupt/resume cycles.
    pub assistant_message_id: Uuid,
    /// Set when a blocking wait-tool suspended this run.
    pub pending_tool_call_id: Option<String>,
    /// Link to the run this one continues (inbox model).
    pub continuation_of_run_id: Option<Uuid>,
    /// Denormalized root of the continuation chain, for stream aliasing.
    pub root_run_id: Option<Uuid>,
    /// End-to-end debugging identifier propagated into workers and tools.
    pub trace_id: Uuid,
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub total_tokens: Option<i64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to create a run row.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub owner_id: String,
    pub thread_id: Uuid,
    pub status: RunStatus,
    pub trigger: RunTrigger,
    pub assistant_message_id: Uuid,
    pub continuation_of_run_id: Option<Uuid>,
    pub root_run_id: Option<Uuid>,
    pub trace_id: Uuid,
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Waiting,
            RunStatus::Deferred,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Deferred.is_terminal());
        assert!(!RunStatus::Waiting.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
