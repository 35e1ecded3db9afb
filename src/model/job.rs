//! Worker jobs: one delegated sub-task per row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a worker job.
///
/// `Created` rows are invisible to the processor; only the barrier install
/// transaction flips them to `Queued` (two-phase commit, see the barrier
/// coordinator). `Created` rows older than five minutes without a barrier
/// are orphans from a rolled-back setup and get reaped to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerJobStatus {
    Created,
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl WorkerJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerJobStatus::Success
                | WorkerJobStatus::Failed
                | WorkerJobStatus::Cancelled
                | WorkerJobStatus::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerJobStatus::Created => "created",
            WorkerJobStatus::Queued => "queued",
            WorkerJobStatus::Running => "running",
            WorkerJobStatus::Success => "success",
            WorkerJobStatus::Failed => "failed",
            WorkerJobStatus::Cancelled => "cancelled",
            WorkerJobStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(WorkerJobStatus::Created),
            "queued" => Some(WorkerJobStatus::Queued),
            "running" => Some(WorkerJobStatus::Running),
            "success" => Some(WorkerJobStatus::Success),
            "failed" => Some(WorkerJobStatus::Failed),
            "cancelled" => Some(WorkerJobStatus::Cancelled),
            "timeout" => Some(WorkerJobStatus::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution config for workspace-mode jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJobConfig {
    pub git_repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
}

/// One delegated sub-task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    pub id: Uuid,
    pub owner_id: String,
    /// The supervisor run that spawned this job.
    pub supervisor_run_id: Uuid,
    /// Identifier of the spawning tool call. Primary idempotency key:
    /// (supervisor_run_id, tool_call_id) maps to at most one job.
    pub tool_call_id: String,
    pub task: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub status: WorkerJobStatus,
    /// Opaque external identifier assigned when execution begins; addresses
    /// the result artifact.
    pub worker_id: Option<String>,
    pub error: Option<String>,
    /// Whether the supervisor has seen this job's result (inbox model).
    pub acknowledged: bool,
    pub trace_id: Option<Uuid>,
    pub config: Option<WorkerJobConfig>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to create a worker job row.
#[derive(Debug, Clone)]
pub struct NewWorkerJob {
    pub owner_id: String,
    pub supervisor_run_id: Uuid,
    pub tool_call_id: String,
    pub task: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub trace_id: Option<Uuid>,
    pub config: Option<WorkerJobConfig>,
}
