//! Durable store abstraction.
//!
//! The store is the single serialization point for every concurrency-critical
//! operation: barrier completion runs under a row lock, run status changes
//! are CAS-style, and barrier installation is one transaction. Backends:
//! in-memory (tests, local dev) and PostgreSQL.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    BarrierCompletion, BarrierEntry, BarrierJob, BarrierStatus, NewMessage, NewRun, NewWorkerJob,
    Run, RunEvent, RunStatus, Thread, ThreadMessage, WorkerBarrier, WorkerJob, WorkerJobStatus,
};

/// Durable record of runs, threads, messages, worker jobs, barriers and
/// events. All rows are scoped by `owner_id` for tenant isolation.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Threads & messages ---

    /// The long-lived supervisor thread for an owner; created on first use.
    async fn find_or_create_supervisor_thread(&self, owner_id: &str) -> Result<Thread, StoreError>;

    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>, StoreError>;

    /// Append a message; the store assigns the monotonic insertion id.
    async fn append_message(&self, msg: NewMessage) -> Result<ThreadMessage, StoreError>;

    /// All messages of a thread ordered by insertion id.
    async fn thread_messages(&self, thread_id: Uuid) -> Result<Vec<ThreadMessage>, StoreError>;

    async fn delete_messages(&self, ids: &[i64]) -> Result<u64, StoreError>;

    /// System messages of a thread whose content contains `marker`, newest
    /// first. Used to prune stale inbox context.
    async fn messages_with_marker(
        &self,
        thread_id: Uuid,
        marker: &str,
    ) -> Result<Vec<ThreadMessage>, StoreError>;

    async fn mark_messages_processed(&self, thread_id: Uuid) -> Result<(), StoreError>;

    /// The tool-response message for a toolCallId, if one exists in the
    /// thread. Makes resume-time injection idempotent.
    async fn find_tool_message(
        &self,
        thread_id: Uuid,
        tool_call_id: &str,
    ) -> Result<Option<ThreadMessage>, StoreError>;

    // --- Runs ---

    async fn create_run(&self, run: NewRun) -> Result<Run, StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError>;

    /// Compare-and-set the status. Returns false (affecting nothing) when
    /// the run is no longer in `from` — the caller lost the race and must
    /// back off quietly.
    async fn cas_run_status(
        &self,
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<bool, StoreError>;

    async fn set_run_status(&self, id: Uuid, status: RunStatus) -> Result<(), StoreError>;

    async fn set_run_pending_tool_call(
        &self,
        id: Uuid,
        tool_call_id: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Record terminal state plus timing and accumulated usage.
    async fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
        duration_ms: i64,
        total_tokens: Option<i64>,
    ) -> Result<(), StoreError>;

    /// Add to the run's token total without finishing it (used when a run
    /// goes back to WAITING with partial usage).
    async fn add_run_tokens(&self, id: Uuid, tokens: i64) -> Result<(), StoreError>;

    /// The continuation run chained directly off `run_id`, if any.
    async fn find_continuation_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError>;

    // --- Worker jobs ---

    async fn create_worker_job(&self, job: NewWorkerJob) -> Result<WorkerJob, StoreError>;

    async fn get_worker_job(&self, id: Uuid) -> Result<Option<WorkerJob>, StoreError>;

    /// Idempotency lookup by the spawning tool call.
    async fn find_job_by_tool_call(
        &self,
        supervisor_run_id: Uuid,
        tool_call_id: &str,
    ) -> Result<Option<WorkerJob>, StoreError>;

    /// Claim the oldest queued job by flipping it to `running`. Returns
    /// `None` when the queue is empty. The flip is atomic; two processors
    /// never claim the same job.
    async fn claim_next_queued_job(&self) -> Result<Option<WorkerJob>, StoreError>;

    /// Record terminal worker state.
    async fn finish_worker_job(
        &self,
        id: Uuid,
        status: WorkerJobStatus,
        worker_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn set_worker_job_status(
        &self,
        id: Uuid,
        status: WorkerJobStatus,
    ) -> Result<(), StoreError>;

    /// Queued/running jobs for an owner, newest first.
    async fn active_worker_jobs(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkerJob>, StoreError>;

    /// Terminal jobs the supervisor has not acknowledged, newest first.
    async fn unacknowledged_worker_jobs(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkerJob>, StoreError>;

    /// Recently acknowledged terminal jobs, newest first.
    async fn recent_acknowledged_worker_jobs(
        &self,
        owner_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkerJob>, StoreError>;

    async fn acknowledge_worker_jobs(&self, ids: &[Uuid]) -> Result<(), StoreError>;

    /// Count of queued/running jobs spawned by a run.
    async fn pending_worker_count(&self, run_id: Uuid) -> Result<i64, StoreError>;

    /// Fail `created` jobs older than `cutoff` that have no barrier
    /// association (orphans from a rolled-back barrier install). Returns
    /// the reaped job ids.
    async fn reap_orphaned_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    // --- Barriers ---

    /// Install (or reset) the run's barrier in ONE transaction:
    /// 1. create the barrier row, or reset counters and delete stale
    ///    barrier-jobs if one already exists for the run;
    /// 2. create one barrier-job per entry;
    /// 3. flip the referenced worker jobs from `created` to `queued`;
    /// 4. transition the run to WAITING.
    ///
    /// Workers can only observe their jobs after this commits, which closes
    /// the fast-worker race.
    async fn install_barrier(
        &self,
        run_id: Uuid,
        entries: &[BarrierEntry],
        deadline: DateTime<Utc>,
    ) -> Result<WorkerBarrier, StoreError>;

    async fn get_barrier(&self, run_id: Uuid) -> Result<Option<WorkerBarrier>, StoreError>;

    async fn set_barrier_status(
        &self,
        run_id: Uuid,
        status: BarrierStatus,
    ) -> Result<(), StoreError>;

    /// Record one worker completion against the run's barrier, under the
    /// barrier row lock. Exactly one completion per batch observes
    /// `Resume`; see `BarrierCompletion`.
    async fn complete_barrier_job(
        &self,
        run_id: Uuid,
        job_id: Uuid,
        result: &str,
        error: Option<&str>,
    ) -> Result<BarrierCompletion, StoreError>;

    /// Barriers still waiting past their deadline.
    async fn expired_barriers(&self, now: DateTime<Utc>) -> Result<Vec<WorkerBarrier>, StoreError>;

    /// Claim an expired barrier for reaping under a no-wait lock: mark it
    /// `resuming`, flip incomplete barrier-jobs to `timeout`, and return the
    /// full batch. Returns `None` when the lock is contended or the barrier
    /// is no longer waiting — another process owns it.
    async fn claim_expired_barrier(
        &self,
        barrier_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<BarrierJob>>, StoreError>;

    // --- Events ---

    /// Append an event; the store assigns the monotonic id.
    async fn append_event(
        &self,
        run_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<RunEvent, StoreError>;

    /// Events of a run with id greater than `after_id`, in order. Drives
    /// durable replay for reconnecting subscribers.
    async fn events_after(&self, run_id: Uuid, after_id: i64) -> Result<Vec<RunEvent>, StoreError>;
}
