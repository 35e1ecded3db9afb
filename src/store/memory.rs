//! In-memory store for tests and single-process local runs.
//!
//! A single mutex serializes every operation, which gives the same
//! serialization guarantees the Postgres backend gets from row locks: the
//! barrier critical section (lookup + counter increment + conditional status
//! flip) is atomic with respect to concurrent completions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    BarrierCompletion, BarrierEntry, BarrierJob, BarrierJobStatus, BarrierStatus, NewMessage,
    NewRun, NewWorkerJob, Run, RunEvent, RunStatus, Thread, ThreadMessage, WorkerBarrier,
    WorkerJob, WorkerJobStatus,
};
use crate::store::Store;

#[derive(Default)]
struct State {
    threads: Vec<Thread>,
    messages: Vec<ThreadMessage>,
    next_message_id: i64,
    runs: HashMap<Uuid, Run>,
    jobs: HashMap<Uuid, WorkerJob>,
    /// Insertion order of job ids, for FIFO claiming.
    job_order: Vec<Uuid>,
    barriers: HashMap<Uuid, WorkerBarrier>,
    barrier_jobs: Vec<BarrierJob>,
    events: Vec<RunEvent>,
    next_event_id: i64,
}

/// Mutex-serialized in-memory store.
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_or_create_supervisor_thread(&self, owner_id: &str) -> Result<Thread, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(thread) = state.threads.iter().find(|t| t.owner_id == owner_id) {
            return Ok(thread.clone());
        }
        let thread = Thread {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            created_at: Utc::now(),
        };
        state.threads.push(thread.clone());
        Ok(thread)
    }

    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.threads.iter().find(|t| t.id == id).cloned())
    }

    async fn append_message(&self, msg: NewMessage) -> Result<ThreadMessage, StoreError> {
        let mut state = self.state.lock().await;
        state.next_message_id += 1;
        let row = ThreadMessage {
            id: state.next_message_id,
            thread_id: msg.thread_id,
            role: msg.role,
            content: msg.content,
            tool_calls: msg.tool_calls,
            tool_call_id: msg.tool_call_id,
            processed: msg.processed,
            internal: msg.internal,
            created_at: Utc::now(),
        };
        state.messages.push(row.clone());
        Ok(row)
    }

    async fn thread_messages(&self, thread_id: Uuid) -> Result<Vec<ThreadMessage>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.thread_id == thread_id)
            .cloned()
            .collect())
    }

    async fn delete_messages(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.messages.len();
        state.messages.retain(|m| !ids.contains(&m.id));
        Ok((before - state.messages.len()) as u64)
    }

    async fn messages_with_marker(
        &self,
        thread_id: Uuid,
        marker: &str,
    ) -> Result<Vec<ThreadMessage>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<ThreadMessage> = state
            .messages
            .iter()
            .filter(|m| {
                m.thread_id == thread_id
                    && m.role == crate::model::Role::System
                    && m.content.contains(marker)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows)
    }

    async fn mark_messages_processed(&self, thread_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for msg in state.messages.iter_mut() {
            if msg.thread_id == thread_id {
                msg.processed = true;
            }
        }
        Ok(())
    }

    async fn find_tool_message(
        &self,
        thread_id: Uuid,
        tool_call_id: &str,
    ) -> Result<Option<ThreadMessage>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .iter()
            .find(|m| {
                m.thread_id == thread_id
                    && m.role == crate::model::Role::Tool
                    && m.tool_call_id.as_deref() == Some(tool_call_id)
            })
            .cloned())
    }

    async fn create_run(&self, run: NewRun) -> Result<Run, StoreError> {
        let mut state = self.state.lock().await;
        let row = Run {
            id: Uuid::new_v4(),
            owner_id: run.owner_id,
            thread_id: run.thread_id,
            status: run.status,
            trigger: run.trigger,
            assistant_message_id: run.assistant_message_id,
            pending_tool_call_id: None,
            continuation_of_run_id: run.continuation_of_run_id,
            root_run_id: run.root_run_id,
            trace_id: run.trace_id,
            model: run.model,
            reasoning_effort: run.reasoning_effort,
            started_at: run.started_at,
            finished_at: None,
            duration_ms: None,
            total_tokens: None,
            error: None,
            created_at: Utc::now(),
        };
        state.runs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.runs.get(&id).cloned())
    }

    async fn cas_run_status(
        &self,
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&id) {
            Some(run) if run.status == from => {
                run.status = to;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity: "run",
                id: id.to_string(),
            }),
        }
    }

    async fn set_run_status(&self, id: Uuid, status: RunStatus) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "run",
            id: id.to_string(),
        })?;
        run.status = status;
        Ok(())
    }

    async fn set_run_pending_tool_call(
        &self,
        id: Uuid,
        tool_call_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "run",
            id: id.to_string(),
        })?;
        run.pending_tool_call_id = tool_call_id.map(String::from);
        Ok(())
    }

    async fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
        duration_ms: i64,
        total_tokens: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "run",
            id: id.to_string(),
        })?;
        run.status = status;
        run.error = error.map(String::from);
        run.finished_at = Some(Utc::now());
        run.duration_ms = Some(duration_ms);
        if let Some(tokens) = total_tokens {
            run.total_tokens = Some(run.total_tokens.unwrap_or(0) + tokens);
        }
        Ok(())
    }

    async fn add_run_tokens(&self, id: Uuid, tokens: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "run",
            id: id.to_string(),
        })?;
        run.total_tokens = Some(run.total_tokens.unwrap_or(0) + tokens);
        Ok(())
    }

    async fn find_continuation_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .find(|r| r.continuation_of_run_id == Some(run_id))
            .cloned())
    }

    async fn create_worker_job(&self, job: NewWorkerJob) -> Result<WorkerJob, StoreError> {
        let mut state = self.state.lock().await;
        let row = WorkerJob {
            id: Uuid::new_v4(),
            owner_id: job.owner_id,
            supervisor_run_id: job.supervisor_run_id,
            tool_call_id: job.tool_call_id,
            task: job.task,
            model: job.model,
            reasoning_effort: job.reasoning_effort,
            status: WorkerJobStatus::Created,
            worker_id: None,
            error: None,
            acknowledged: false,
            trace_id: job.trace_id,
            config: job.config,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        };
        state.jobs.insert(row.id, row.clone());
        state.job_order.push(row.id);
        Ok(row)
    }

    async fn get_worker_job(&self, id: Uuid) -> Result<Option<WorkerJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn find_job_by_tool_call(
        &self,
        supervisor_run_id: Uuid,
        tool_call_id: &str,
    ) -> Result<Option<WorkerJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .find(|j| j.supervisor_run_id == supervisor_run_id && j.tool_call_id == tool_call_id)
            .cloned())
    }

    async fn claim_next_queued_job(&self) -> Result<Option<WorkerJob>, StoreError> {
        let mut state = self.state.lock().await;
        let candidate = state
            .job_order
            .iter()
            .find(|id| {
                state
                    .jobs
                    .get(*id)
                    .map(|j| j.status == WorkerJobStatus::Queued)
                    .unwrap_or(false)
            })
            .copied();
        match candidate {
            Some(id) => {
                let job = state.jobs.get_mut(&id).expect("job indexed in order list");
                job.status = WorkerJobStatus::Running;
                job.started_at = Some(Utc::now());
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn finish_worker_job(
        &self,
        id: Uuid,
        status: WorkerJobStatus,
        worker_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "worker_job",
            id: id.to_string(),
        })?;
        job.status = status;
        if let Some(worker_id) = worker_id {
            job.worker_id = Some(worker_id.to_string());
        }
        job.error = error.map(String::from);
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn set_worker_job_status(
        &self,
        id: Uuid,
        status: WorkerJobStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "worker_job",
            id: id.to_string(),
        })?;
        job.status = status;
        Ok(())
    }

    async fn active_worker_jobs(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkerJob>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<WorkerJob> = state
            .jobs
            .values()
            .filter(|j| {
                j.owner_id == owner_id
                    && matches!(j.status, WorkerJobStatus::Queued | WorkerJobStatus::Running)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn unacknowledged_worker_jobs(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkerJob>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<WorkerJob> = state
            .jobs
            .values()
            .filter(|j| {
                j.owner_id == owner_id
                    && matches!(j.status, WorkerJobStatus::Success | WorkerJobStatus::Failed)
                    && !j.acknowledged
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn recent_acknowledged_worker_jobs(
        &self,
        owner_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkerJob>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<WorkerJob> = state
            .jobs
            .values()
            .filter(|j| {
                j.owner_id == owner_id
                    && matches!(j.status, WorkerJobStatus::Success | WorkerJobStatus::Failed)
                    && j.acknowledged
                    && j.created_at >= since
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn acknowledge_worker_jobs(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for id in ids {
            if let Some(job) = state.jobs.get_mut(id) {
                job.acknowledged = true;
            }
        }
        Ok(())
    }

    async fn pending_worker_count(&self, run_id: Uuid) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| {
                j.supervisor_run_id == run_id
                    && matches!(j.status, WorkerJobStatus::Queued | WorkerJobStatus::Running)
            })
            .count() as i64)
    }

    async fn reap_orphaned_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.lock().await;
        let with_barrier: std::collections::HashSet<Uuid> =
            state.barrier_jobs.iter().map(|bj| bj.job_id).collect();
        let mut reaped = Vec::new();
        for job in state.jobs.values_mut() {
            if job.status == WorkerJobStatus::Created
                && job.created_at < cutoff
                && !with_barrier.contains(&job.id)
            {
                job.status = WorkerJobStatus::Failed;
                job.error = Some("Orphaned job - barrier creation failed".to_string());
                job.finished_at = Some(Utc::now());
                reaped.push(job.id);
            }
        }
        Ok(reaped)
    }

    async fn install_barrier(
        &self,
        run_id: Uuid,
        entries: &[BarrierEntry],
        deadline: DateTime<Utc>,
    ) -> Result<WorkerBarrier, StoreError> {
        let mut state = self.state.lock().await;

        let barrier_id = match state.barriers.get_mut(&run_id) {
            Some(existing) => {
                // Reuse: stale barrier-jobs would poison the next resume.
                existing.status = BarrierStatus::Waiting;
                existing.expected_count = entries.len() as i32;
                existing.completed_count = 0;
                existing.deadline_at = deadline;
                let id = existing.id;
                state.barrier_jobs.retain(|bj| bj.barrier_id != id);
                id
            }
            None => {
                let barrier = WorkerBarrier {
                    id: Uuid::new_v4(),
                    run_id,
                    expected_count: entries.len() as i32,
                    completed_count: 0,
                    status: BarrierStatus::Waiting,
                    deadline_at: deadline,
                    created_at: Utc::now(),
                };
                let id = barrier.id;
                state.barriers.insert(run_id, barrier);
                id
            }
        };

        for entry in entries {
            if state
                .barrier_jobs
                .iter()
                .any(|bj| bj.barrier_id == barrier_id && bj.job_id == entry.job_id)
            {
                return Err(StoreError::Conflict(format!(
                    "job {} already in barrier {}",
                    entry.job_id, barrier_id
                )));
            }
            state.barrier_jobs.push(BarrierJob {
                barrier_id,
                job_id: entry.job_id,
                tool_call_id: entry.tool_call_id.clone(),
                status: BarrierJobStatus::Queued,
                result: None,
                error: None,
                completed_at: None,
            });
            if let Some(job) = state.jobs.get_mut(&entry.job_id) {
                if job.status == WorkerJobStatus::Created {
                    job.status = WorkerJobStatus::Queued;
                }
            }
        }

        if let Some(run) = state.runs.get_mut(&run_id) {
            run.status = RunStatus::Waiting;
        }

        Ok(state
            .barriers
            .get(&run_id)
            .cloned()
            .expect("barrier just installed"))
    }

    async fn get_barrier(&self, run_id: Uuid) -> Result<Option<WorkerBarrier>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.barriers.get(&run_id).cloned())
    }

    async fn set_barrier_status(
        &self,
        run_id: Uuid,
        status: BarrierStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(barrier) = state.barriers.get_mut(&run_id) {
            barrier.status = status;
        }
        Ok(())
    }

    async fn complete_barrier_job(
        &self,
        run_id: Uuid,
        job_id: Uuid,
        result: &str,
        error: Option<&str>,
    ) -> Result<BarrierCompletion, StoreError> {
        // The whole critical section holds the state lock, mirroring the
        // SELECT FOR UPDATE transaction in the Postgres backend.
        let mut state = self.state.lock().await;

        let Some(barrier) = state.barriers.get(&run_id).cloned() else {
            return Ok(BarrierCompletion::Skipped {
                reason: "no barrier found".to_string(),
            });
        };

        if barrier.status != BarrierStatus::Waiting {
            return Ok(BarrierCompletion::Skipped {
                reason: format!("barrier is {}, not waiting", barrier.status.as_str()),
            });
        }

        let Some(barrier_job) = state
            .barrier_jobs
            .iter_mut()
            .find(|bj| bj.barrier_id == barrier.id && bj.job_id == job_id)
        else {
            return Ok(BarrierCompletion::Skipped {
                reason: "no barrier job found".to_string(),
            });
        };

        if barrier_job.status.is_terminal() {
            return Ok(BarrierCompletion::Skipped {
                reason: format!("barrier job already {}", barrier_job.status.as_str()),
            });
        }

        barrier_job.status = if error.is_some() {
            BarrierJobStatus::Failed
        } else {
            BarrierJobStatus::Completed
        };
        barrier_job.result = Some(result.to_string());
        barrier_job.error = error.map(String::from);
        barrier_job.completed_at = Some(Utc::now());

        let barrier = state.barriers.get_mut(&run_id).expect("barrier present");
        barrier.completed_count += 1;

        if barrier.completed_count >= barrier.expected_count {
            barrier.status = BarrierStatus::Resuming;
            let barrier_id = barrier.id;
            let batch: Vec<BarrierJob> = state
                .barrier_jobs
                .iter()
                .filter(|bj| bj.barrier_id == barrier_id)
                .cloned()
                .collect();
            Ok(BarrierCompletion::Resume { batch })
        } else {
            Ok(BarrierCompletion::Waiting {
                completed: barrier.completed_count,
                expected: barrier.expected_count,
            })
        }
    }

    async fn expired_barriers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkerBarrier>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .barriers
            .values()
            .filter(|b| b.status == BarrierStatus::Waiting && b.deadline_at < now)
            .cloned()
            .collect())
    }

    async fn claim_expired_barrier(
        &self,
        barrier_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<BarrierJob>>, StoreError> {
        let mut state = self.state.lock().await;

        let Some(barrier) = state.barriers.values_mut().find(|b| b.id == barrier_id) else {
            return Ok(None);
        };
        if barrier.status != BarrierStatus::Waiting {
            return Ok(None);
        }
        barrier.status = BarrierStatus::Resuming;

        for bj in state.barrier_jobs.iter_mut() {
            if bj.barrier_id == barrier_id && !bj.status.is_terminal() {
                bj.status = BarrierJobStatus::Timeout;
                bj.error = Some("Worker timed out (deadline exceeded)".to_string());
                bj.completed_at = Some(now);
            }
        }

        Ok(Some(
            state
                .barrier_jobs
                .iter()
                .filter(|bj| bj.barrier_id == barrier_id)
                .cloned()
                .collect(),
        ))
    }

    async fn append_event(
        &self,
        run_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<RunEvent, StoreError> {
        let mut state = self.state.lock().await;
        state.next_event_id += 1;
        let event = RunEvent {
            id: state.next_event_id,
            run_id,
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
        };
        state.events.push(event.clone());
        Ok(event)
    }

    async fn events_after(&self, run_id: Uuid, after_id: i64) -> Result<Vec<RunEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.run_id == run_id && e.id > after_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job_id: Uuid, tool_call_id: &str) -> BarrierEntry {
        BarrierEntry {
            job_id,
            tool_call_id: tool_call_id.to_string(),
        }
    }

    async fn seed_run(store: &MemoryStore) -> Run {
        let thread = store.find_or_create_supervisor_thread("owner-1").await.unwrap();
        store
            .create_run(NewRun {
                owner_id: "owner-1".to_string(),
                thread_id: thread.id,
                status: RunStatus::Running,
                trigger: crate::model::RunTrigger::Api,
                assistant_message_id: Uuid::new_v4(),
                continuation_of_run_id: None,
                root_run_id: None,
                trace_id: Uuid::new_v4(),
                model: "gpt-5".to_string(),
                reasoning_effort: None,
                started_at: Some(Utc::now()),
            })
            .await
            .unwrap()
    }

    async fn seed_job(store: &MemoryStore, run_id: Uuid, tool_call_id: &str) -> WorkerJob {
        store
            .create_worker_job(NewWorkerJob {
                owner_id: "owner-1".to_string(),
                supervisor_run_id: run_id,
                tool_call_id: tool_call_id.to_string(),
                task: "do something".to_string(),
                model: "gpt-5-mini".to_string(),
                reasoning_effort: None,
                trace_id: None,
                config: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_supervisor_thread_is_singleton_per_owner() {
        let store = MemoryStore::new();
        let a = store.find_or_create_supervisor_thread("u1").await.unwrap();
        let b = store.find_or_create_supervisor_thread("u1").await.unwrap();
        let c = store.find_or_create_supervisor_thread("u2").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn test_message_ids_are_monotonic() {
        let store = MemoryStore::new();
        let thread = store.find_or_create_supervisor_thread("u1").await.unwrap();
        let m1 = store
            .append_message(NewMessage::user(thread.id, "one"))
            .await
            .unwrap();
        let m2 = store
            .append_message(NewMessage::user(thread.id, "two"))
            .await
            .unwrap();
        assert!(m2.id > m1.id);

        let all = store.thread_messages(thread.id).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "one");
    }

    #[tokio::test]
    async fn test_cas_run_status_loss_detection() {
        let store = MemoryStore::new();
        let run = seed_run(&store).await;

        assert!(store
            .cas_run_status(run.id, RunStatus::Running, RunStatus::Waiting)
            .await
            .unwrap());
        // Second CAS from the same precondition loses.
        assert!(!store
            .cas_run_status(run.id, RunStatus::Running, RunStatus::Waiting)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_install_barrier_flips_jobs_and_sets_waiting() {
        let store = MemoryStore::new();
        let run = seed_run(&store).await;
        let job = seed_job(&store, run.id, "call_1").await;
        assert_eq!(job.status, WorkerJobStatus::Created);

        let deadline = Utc::now() + chrono::Duration::minutes(10);
        let barrier = store
            .install_barrier(run.id, &[entry(job.id, "call_1")], deadline)
            .await
            .unwrap();
        assert_eq!(barrier.expected_count, 1);

        let job = store.get_worker_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, WorkerJobStatus::Queued);
        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Waiting);
    }

    #[tokio::test]
    async fn test_barrier_completion_last_one_claims_resume() {
        let store = MemoryStore::new();
        let run = seed_run(&store).await;
        let j1 = seed_job(&store, run.id, "call_1").await;
        let j2 = seed_job(&store, run.id, "call_2").await;
        let deadline = Utc::now() + chrono::Duration::minutes(10);
        store
            .install_barrier(
                run.id,
                &[entry(j1.id, "call_1"), entry(j2.id, "call_2")],
                deadline,
            )
            .await
            .unwrap();

        let first = store
            .complete_barrier_job(run.id, j1.id, "result one", None)
            .await
            .unwrap();
        assert!(matches!(
            first,
            BarrierCompletion::Waiting {
                completed: 1,
                expected: 2
            }
        ));

        let second = store
            .complete_barrier_job(run.id, j2.id, "result two", None)
            .await
            .unwrap();
        match second {
            BarrierCompletion::Resume { batch } => {
                assert_eq!(batch.len(), 2);
                assert!(batch.iter().all(|bj| bj.status.is_terminal()));
            }
            other => panic!("expected resume, got {:?}", other),
        }

        // A duplicate completion is skipped: the barrier already claimed.
        let dup = store
            .complete_barrier_job(run.id, j2.id, "result two", None)
            .await
            .unwrap();
        assert!(matches!(dup, BarrierCompletion::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_barrier_reuse_clears_stale_jobs() {
        let store = MemoryStore::new();
        let run = seed_run(&store).await;
        let j1 = seed_job(&store, run.id, "call_1").await;
        let deadline = Utc::now() + chrono::Duration::minutes(10);
        store
            .install_barrier(run.id, &[entry(j1.id, "call_1")], deadline)
            .await
            .unwrap();
        let completion = store
            .complete_barrier_job(run.id, j1.id, "done", None)
            .await
            .unwrap();
        assert!(matches!(completion, BarrierCompletion::Resume { .. }));

        // Re-interrupt with a fresh batch reuses the same barrier row.
        let j2 = seed_job(&store, run.id, "call_2").await;
        let barrier = store
            .install_barrier(run.id, &[entry(j2.id, "call_2")], deadline)
            .await
            .unwrap();
        assert_eq!(barrier.completed_count, 0);
        assert_eq!(barrier.expected_count, 1);

        match store
            .complete_barrier_job(run.id, j2.id, "done again", None)
            .await
            .unwrap()
        {
            BarrierCompletion::Resume { batch } => {
                assert_eq!(batch.len(), 1, "stale barrier jobs must be pruned");
                assert_eq!(batch[0].tool_call_id, "call_2");
            }
            other => panic!("expected resume, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_claim_next_queued_job_is_exclusive() {
        let store = MemoryStore::new();
        let run = seed_run(&store).await;
        let job = seed_job(&store, run.id, "call_1").await;
        let deadline = Utc::now() + chrono::Duration::minutes(10);
        store
            .install_barrier(run.id, &[entry(job.id, "call_1")], deadline)
            .await
            .unwrap();

        let claimed = store.claim_next_queued_job().await.unwrap();
        assert_eq!(claimed.unwrap().id, job.id);
        assert!(store.claim_next_queued_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphan_reaping_skips_jobs_with_barriers() {
        let store = MemoryStore::new();
        let run = seed_run(&store).await;
        let orphan = seed_job(&store, run.id, "call_orphan").await;
        let covered = seed_job(&store, run.id, "call_covered").await;
        let deadline = Utc::now() + chrono::Duration::minutes(10);
        store
            .install_barrier(run.id, &[entry(covered.id, "call_covered")], deadline)
            .await
            .unwrap();

        // Cutoff in the future makes every created job "old enough".
        let reaped = store
            .reap_orphaned_jobs(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reaped, vec![orphan.id]);

        let orphan = store.get_worker_job(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, WorkerJobStatus::Failed);
        let covered = store.get_worker_job(covered.id).await.unwrap().unwrap();
        assert_eq!(covered.status, WorkerJobStatus::Queued);
    }

    #[tokio::test]
    async fn test_claim_expired_barrier_times_out_incomplete_jobs() {
        let store = MemoryStore::new();
        let run = seed_run(&store).await;
        let j1 = seed_job(&store, run.id, "call_1").await;
        let j2 = seed_job(&store, run.id, "call_2").await;
        let deadline = Utc::now() - chrono::Duration::minutes(1);
        let barrier = store
            .install_barrier(
                run.id,
                &[entry(j1.id, "call_1"), entry(j2.id, "call_2")],
                deadline,
            )
            .await
            .unwrap();
        store
            .complete_barrier_job(run.id, j1.id, "made it", None)
            .await
            .unwrap();

        let expired = store.expired_barriers(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);

        let batch = store
            .claim_expired_barrier(barrier.id, Utc::now())
            .await
            .unwrap()
            .expect("claimable");
        assert_eq!(batch.len(), 2);
        let timed_out = batch.iter().find(|bj| bj.job_id == j2.id).unwrap();
        assert_eq!(timed_out.status, BarrierJobStatus::Timeout);
        assert!(timed_out.error.as_deref().unwrap().contains("timed out"));

        // Second claim finds the barrier no longer waiting.
        assert!(store
            .claim_expired_barrier(barrier.id, Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_event_ids_are_monotonic_per_store() {
        let store = MemoryStore::new();
        let run = seed_run(&store).await;
        let e1 = store
            .append_event(run.id, "supervisor_started", serde_json::json!({}))
            .await
            .unwrap();
        let e2 = store
            .append_event(run.id, "supervisor_complete", serde_json::json!({}))
            .await
            .unwrap();
        assert!(e2.id > e1.id);

        let replay = store.events_after(run.id, e1.id).await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].event_type, "supervisor_complete");
    }
}
