//! Barrier rows: the per-run synchronization primitive for parallel workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status guard for the atomic resume claim.
///
/// Only the `Waiting` → `Resuming` transition, taken under the store's row
/// lock, may trigger a resume. Everything else observes and backs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierStatus {
    Waiting,
    Resuming,
    Completed,
    Failed,
}

impl BarrierStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BarrierStatus::Waiting => "waiting",
            BarrierStatus::Resuming => "resuming",
            BarrierStatus::Completed => "completed",
            BarrierStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(BarrierStatus::Waiting),
            "resuming" => Some(BarrierStatus::Resuming),
            "completed" => Some(BarrierStatus::Completed),
            "failed" => Some(BarrierStatus::Failed),
            _ => None,
        }
    }
}

/// Tracks a batch of parallel workers for one supervisor run.
///
/// One barrier per run, enforced by a unique constraint on `run_id`. On
/// re-interruption the same row is reset and reused rather than replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBarrier {
    pub id: Uuid,
    pub run_id: Uuid,
    pub expected_count: i32,
    pub completed_count: i32,
    pub status: BarrierStatus,
    /// Absolute deadline; the reaper times out anything still waiting past it.
    pub deadline_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Status of an individual job within a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierJobStatus {
    Queued,
    Completed,
    Failed,
    Timeout,
}

impl BarrierJobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BarrierJobStatus::Queued)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BarrierJobStatus::Queued => "queued",
            BarrierJobStatus::Completed => "completed",
            BarrierJobStatus::Failed => "failed",
            BarrierJobStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(BarrierJobStatus::Queued),
            "completed" => Some(BarrierJobStatus::Completed),
            "failed" => Some(BarrierJobStatus::Failed),
            "timeout" => Some(BarrierJobStatus::Timeout),
            _ => None,
        }
    }
}

/// Association row joining a barrier to a worker job.
///
/// Carries the tool_call_id needed to synthesize the tool-response message
/// on resume, and caches the result so the batch resume never re-fetches
/// from the artifact store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierJob {
    pub barrier_id: Uuid,
    pub job_id: Uuid,
    pub tool_call_id: String,
    pub status: BarrierJobStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input to barrier installation: one entry per spawned worker.
#[derive(Debug, Clone)]
pub struct BarrierEntry {
    pub job_id: Uuid,
    pub tool_call_id: String,
}

/// Outcome of reporting one worker completion against a barrier.
///
/// For a barrier expecting N workers, exactly one of the N completion calls
/// observes `Resume`; the rest observe `Waiting` or `Skipped`.
#[derive(Debug, Clone)]
pub enum BarrierCompletion {
    /// This completion filled the barrier and claimed the resume.
    Resume { batch: Vec<BarrierJob> },
    /// Recorded, but other workers are still outstanding.
    Waiting { completed: i32, expected: i32 },
    /// Nothing recorded: barrier absent, not waiting, or job already done.
    Skipped { reason: String },
}
