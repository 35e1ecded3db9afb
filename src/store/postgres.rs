//! PostgreSQL store.
//!
//! The barrier critical sections run inside transactions with row locks:
//! `FOR UPDATE` serializes concurrent completions, `FOR UPDATE NOWAIT` lets
//! the reaper skip barriers another process already claimed, and
//! `FOR UPDATE SKIP LOCKED` keeps queue claims contention-free.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::model::{
    BarrierCompletion, BarrierEntry, BarrierJob, BarrierJobStatus, BarrierStatus, NewMessage,
    NewRun, NewWorkerJob, Role, Run, RunEvent, RunStatus, RunTrigger, Thread, ThreadMessage,
    WorkerBarrier, WorkerJob, WorkerJobConfig, WorkerJobStatus,
};
use crate::store::Store;

/// Postgres-backed store.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a store and verify connectivity.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Migrations run externally: `refinery migrate -c refinery.toml -p migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        tracing::info!("Database migrations should be run via: refinery migrate -p migrations/");
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, StoreError> {
        Ok(self.pool.get().await?)
    }
}

fn parse_status<T>(raw: &str, parse: fn(&str) -> Option<T>, what: &str) -> Result<T, StoreError> {
    parse(raw).ok_or_else(|| StoreError::Serialization(format!("bad {}: {}", what, raw)))
}

fn run_from_row(row: &Row) -> Result<Run, StoreError> {
    let status: String = row.get("status");
    let trigger: String = row.get("trigger");
    Ok(Run {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        thread_id: row.get("thread_id"),
        status: parse_status(&status, RunStatus::parse, "run status")?,
        trigger: parse_status(&trigger, RunTrigger::parse, "run trigger")?,
        assistant_message_id: row.get("assistant_message_id"),
        pending_tool_call_id: row.get("pending_tool_call_id"),
        continuation_of_run_id: row.get("continuation_of_run_id"),
        root_run_id: row.get("root_run_id"),
        trace_id: row.get("trace_id"),
        model: row.get("model"),
        reasoning_effort: row.get("reasoning_effort"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        duration_ms: row.get("duration_ms"),
        total_tokens: row.get("total_tokens"),
        error: row.get("error"),
        created_at: row.get("created_at"),
    })
}

fn message_from_row(row: &Row) -> Result<ThreadMessage, StoreError> {
    let role: String = row.get("role");
    let tool_calls: Option<serde_json::Value> = row.get("tool_calls");
    let tool_calls = match tool_calls {
        Some(value) => Some(
            serde_json::from_value(value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        ),
        None => None,
    };
    Ok(ThreadMessage {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        role: parse_status(&role, Role::parse, "message role")?,
        content: row.get("content"),
        tool_calls,
        tool_call_id: row.get("tool_call_id"),
        processed: row.get("processed"),
        internal: row.get("internal"),
        created_at: row.get("created_at"),
    })
}

fn job_from_row(row: &Row) -> Result<WorkerJob, StoreError> {
    let status: String = row.get("status");
    let config: Option<serde_json::Value> = row.get("config");
    let config: Option<WorkerJobConfig> = match config {
        Some(value) => Some(
            serde_json::from_value(value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        ),
        None => None,
    };
    Ok(WorkerJob {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        supervisor_run_id: row.get("supervisor_run_id"),
        tool_call_id: row.get("tool_call_id"),
        task: row.get("task"),
        model: row.get("model"),
        reasoning_effort: row.get("reasoning_effort"),
        status: parse_status(&status, WorkerJobStatus::parse, "job status")?,
        worker_id: row.get("worker_id"),
        error: row.get("error"),
        acknowledged: row.get("acknowledged"),
        trace_id: row.get("trace_id"),
        config,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        created_at: row.get("created_at"),
    })
}

fn barrier_from_row(row: &Row) -> Result<WorkerBarrier, StoreError> {
    let status: String = row.get("status");
    Ok(WorkerBarrier {
        id: row.get("id"),
        run_id: row.get("run_id"),
        expected_count: row.get("expected_count"),
        completed_count: row.get("completed_count"),
        status: parse_status(&status, BarrierStatus::parse, "barrier status")?,
        deadline_at: row.get("deadline_at"),
        created_at: row.get("created_at"),
    })
}

fn barrier_job_from_row(row: &Row) -> Result<BarrierJob, StoreError> {
    let status: String = row.get("status");
    Ok(BarrierJob {
        barrier_id: row.get("barrier_id"),
        job_id: row.get("job_id"),
        tool_call_id: row.get("tool_call_id"),
        status: parse_status(&status, BarrierJobStatus::parse, "barrier job status")?,
        result: row.get("result"),
        error: row.get("error"),
        completed_at: row.get("completed_at"),
    })
}

fn event_from_row(row: &Row) -> RunEvent {
    RunEvent {
        id: row.get("id"),
        run_id: row.get("run_id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
    }
}

const JOB_COLUMNS: &str = "id, owner_id, supervisor_run_id, tool_call_id, task, model, \
     reasoning_effort, status, worker_id, error, acknowledged, trace_id, config, \
     started_at, finished_at, created_at";

const RUN_COLUMNS: &str = "id, owner_id, thread_id, status, trigger, assistant_message_id, \
     pending_tool_call_id, continuation_of_run_id, root_run_id, trace_id, model, \
     reasoning_effort, started_at, finished_at, duration_ms, total_tokens, error, created_at";

const MESSAGE_COLUMNS: &str =
    "id, thread_id, role, content, tool_calls, tool_call_id, processed, internal, created_at";

const BARRIER_COLUMNS: &str =
    "id, run_id, expected_count, completed_count, status, deadline_at, created_at";

const BARRIER_JOB_COLUMNS: &str =
    "barrier_id, job_id, tool_call_id, status, result, error, completed_at";

#[async_trait]
impl Store for PgStore {
    async fn find_or_create_supervisor_thread(&self, owner_id: &str) -> Result<Thread, StoreError> {
        let conn = self.conn().await?;
        let id = Uuid::new_v4();
        // Insert-or-fetch under the unique(owner_id) constraint.
        let row = conn
            .query_one(
                "INSERT INTO threads (id, owner_id) VALUES ($1, $2)
                 ON CONFLICT (owner_id) DO UPDATE SET owner_id = EXCLUDED.owner_id
                 RETURNING id, owner_id, created_at",
                &[&id, &owner_id],
            )
            .await?;
        Ok(Thread {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            created_at: row.get("created_at"),
        })
    }

    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, owner_id, created_at FROM threads WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(row.map(|row| Thread {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            created_at: row.get("created_at"),
        }))
    }

    async fn append_message(&self, msg: NewMessage) -> Result<ThreadMessage, StoreError> {
        let conn = self.conn().await?;
        let tool_calls = msg
            .tool_calls
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let row = conn
            .query_one(
                format!(
                    "INSERT INTO thread_messages \
                     (thread_id, role, content, tool_calls, tool_call_id, processed, internal) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {MESSAGE_COLUMNS}"
                ).as_str(),
                &[
                    &msg.thread_id,
                    &msg.role.as_str(),
                    &msg.content,
                    &tool_calls,
                    &msg.tool_call_id,
                    &msg.processed,
                    &msg.internal,
                ],
            )
            .await?;
        message_from_row(&row)
    }

    async fn thread_messages(&self, thread_id: Uuid) -> Result<Vec<ThreadMessage>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                format!(
                    "SELECT {MESSAGE_COLUMNS} FROM thread_messages \
                     WHERE thread_id = $1 ORDER BY id"
                ).as_str(),
                &[&thread_id],
            )
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn delete_messages(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute(
                "DELETE FROM thread_messages WHERE id = ANY($1)",
                &[&ids.to_vec()],
            )
            .await?;
        Ok(deleted)
    }

    async fn messages_with_marker(
        &self,
        thread_id: Uuid,
        marker: &str,
    ) -> Result<Vec<ThreadMessage>, StoreError> {
        let conn = self.conn().await?;
        let pattern = format!("%{}%", marker);
        let rows = conn
            .query(
                format!(
                    "SELECT {MESSAGE_COLUMNS} FROM thread_messages \
                     WHERE thread_id = $1 AND role = 'system' AND content LIKE $2 \
                     ORDER BY id DESC"
                ).as_str(),
                &[&thread_id, &pattern],
            )
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn mark_messages_processed(&self, thread_id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE thread_messages SET processed = TRUE WHERE thread_id = $1 AND NOT processed",
            &[&thread_id],
        )
        .await?;
        Ok(())
    }

    async fn find_tool_message(
        &self,
        thread_id: Uuid,
        tool_call_id: &str,
    ) -> Result<Option<ThreadMessage>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                format!(
                    "SELECT {MESSAGE_COLUMNS} FROM thread_messages \
                     WHERE thread_id = $1 AND role = 'tool' AND tool_call_id = $2 \
                     ORDER BY id LIMIT 1"
                ).as_str(),
                &[&thread_id, &tool_call_id],
            )
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn create_run(&self, run: NewRun) -> Result<Run, StoreError> {
        let conn = self.conn().await?;
        let id = Uuid::new_v4();
        let row = conn
            .query_one(
                format!(
                    "INSERT INTO runs \
                     (id, owner_id, thread_id, status, trigger, assistant_message_id, \
                      continuation_of_run_id, root_run_id, trace_id, model, reasoning_effort, \
                      started_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                     RETURNING {RUN_COLUMNS}"
                ).as_str(),
                &[
                    &id,
                    &run.owner_id,
                    &run.thread_id,
                    &run.status.as_str(),
                    &run.trigger.as_str(),
                    &run.assistant_message_id,
                    &run.continuation_of_run_id,
                    &run.root_run_id,
                    &run.trace_id,
                    &run.model,
                    &run.reasoning_effort,
                    &run.started_at,
                ],
            )
            .await?;
        run_from_row(&row)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1").as_str(),
                &[&id],
            )
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn cas_run_status(
        &self,
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE runs SET status = $3 WHERE id = $1 AND status = $2",
                &[&id, &from.as_str(), &to.as_str()],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn set_run_status(&self, id: Uuid, status: RunStatus) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE runs SET status = $2 WHERE id = $1",
            &[&id, &status.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn set_run_pending_tool_call(
        &self,
        id: Uuid,
        tool_call_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE runs SET pending_tool_call_id = $2 WHERE id = $1",
            &[&id, &tool_call_id],
        )
        .await?;
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
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE runs SET status = $2, error = $3, finished_at = NOW(), duration_ms = $4, \
             total_tokens = CASE WHEN $5::BIGINT IS NULL THEN total_tokens \
                                 ELSE COALESCE(total_tokens, 0) + $5 END \
             WHERE id = $1",
            &[&id, &status.as_str(), &error, &duration_ms, &total_tokens],
        )
        .await?;
        Ok(())
    }

    async fn add_run_tokens(&self, id: Uuid, tokens: i64) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE runs SET total_tokens = COALESCE(total_tokens, 0) + $2 WHERE id = $1",
            &[&id, &tokens],
        )
        .await?;
        Ok(())
    }

    async fn find_continuation_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE continuation_of_run_id = $1 \
                     ORDER BY created_at LIMIT 1"
                ).as_str(),
                &[&run_id],
            )
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn create_worker_job(&self, job: NewWorkerJob) -> Result<WorkerJob, StoreError> {
        let conn = self.conn().await?;
        let id = Uuid::new_v4();
        let config = job
            .config
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let row = conn
            .query_one(
                format!(
                    "INSERT INTO worker_jobs \
                     (id, owner_id, supervisor_run_id, tool_call_id, task, model, \
                      reasoning_effort, status, trace_id, config) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, 'created', $8, $9) \
                     RETURNING {JOB_COLUMNS}"
                ).as_str(),
                &[
                    &id,
                    &job.owner_id,
                    &job.supervisor_run_id,
                    &job.tool_call_id,
                    &job.task,
                    &job.model,
                    &job.reasoning_effort,
                    &job.trace_id,
                    &config,
                ],
            )
            .await?;
        job_from_row(&row)
    }

    async fn get_worker_job(&self, id: Uuid) -> Result<Option<WorkerJob>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                format!("SELECT {JOB_COLUMNS} FROM worker_jobs WHERE id = $1").as_str(),
                &[&id],
            )
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_job_by_tool_call(
        &self,
        supervisor_run_id: Uuid,
        tool_call_id: &str,
    ) -> Result<Option<WorkerJob>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                format!(
                    "SELECT {JOB_COLUMNS} FROM worker_jobs \
                     WHERE supervisor_run_id = $1 AND tool_call_id = $2"
                ).as_str(),
                &[&supervisor_run_id, &tool_call_id],
            )
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_next_queued_job(&self) -> Result<Option<WorkerJob>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                format!(
                    "UPDATE worker_jobs SET status = 'running', started_at = NOW() \
                     WHERE id = (SELECT id FROM worker_jobs WHERE status = 'queued' \
                                 ORDER BY created_at LIMIT 1 FOR UPDATE SKIP LOCKED) \
                     RETURNING {JOB_COLUMNS}"
                ).as_str(),
                &[],
            )
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn finish_worker_job(
        &self,
        id: Uuid,
        status: WorkerJobStatus,
        worker_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE worker_jobs SET status = $2, worker_id = COALESCE($3, worker_id), \
             error = $4, finished_at = NOW() WHERE id = $1",
            &[&id, &status.as_str(), &worker_id, &error],
        )
        .await?;
        Ok(())
    }

    async fn set_worker_job_status(
        &self,
        id: Uuid,
        status: WorkerJobStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE worker_jobs SET status = $2 WHERE id = $1",
            &[&id, &status.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn active_worker_jobs(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkerJob>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                format!(
                    "SELECT {JOB_COLUMNS} FROM worker_jobs \
                     WHERE owner_id = $1 AND status IN ('queued', 'running') \
                     ORDER BY created_at DESC LIMIT $2"
                ).as_str(),
                &[&owner_id, &(limit as i64)],
            )
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn unacknowledged_worker_jobs(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkerJob>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                format!(
                    "SELECT {JOB_COLUMNS} FROM worker_jobs \
                     WHERE owner_id = $1 AND status IN ('success', 'failed') AND NOT acknowledged \
                     ORDER BY created_at DESC LIMIT $2"
                ).as_str(),
                &[&owner_id, &(limit as i64)],
            )
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn recent_acknowledged_worker_jobs(
        &self,
        owner_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkerJob>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                format!(
                    "SELECT {JOB_COLUMNS} FROM worker_jobs \
                     WHERE owner_id = $1 AND status IN ('success', 'failed') AND acknowledged \
                       AND created_at >= $2 \
                     ORDER BY created_at DESC LIMIT $3"
                ).as_str(),
                &[&owner_id, &since, &(limit as i64)],
            )
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn acknowledge_worker_jobs(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE worker_jobs SET acknowledged = TRUE WHERE id = ANY($1)",
            &[&ids.to_vec()],
        )
        .await?;
        Ok(())
    }

    async fn pending_worker_count(&self, run_id: Uuid) -> Result<i64, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) AS n FROM worker_jobs \
                 WHERE supervisor_run_id = $1 AND status IN ('queued', 'running')",
                &[&run_id],
            )
            .await?;
        Ok(row.get("n"))
    }

    async fn reap_orphaned_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "UPDATE worker_jobs SET status = 'failed', \
                   error = 'Orphaned job - barrier creation failed', finished_at = NOW() \
                 WHERE status = 'created' AND created_at < $1 \
                   AND NOT EXISTS (SELECT 1 FROM worker_barrier_jobs b WHERE b.job_id = worker_jobs.id) \
                 RETURNING id",
                &[&cutoff],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn install_barrier(
        &self,
        run_id: Uuid,
        entries: &[BarrierEntry],
        deadline: DateTime<Utc>,
    ) -> Result<WorkerBarrier, StoreError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let existing = tx
            .query_opt(
                format!(
                    "SELECT {BARRIER_COLUMNS} FROM worker_barriers WHERE run_id = $1 FOR UPDATE"
                ).as_str(),
                &[&run_id],
            )
            .await?;

        let barrier_id = match existing {
            Some(row) => {
                let barrier_id: Uuid = row.get("id");
                // Reuse: stale barrier-jobs would poison the next resume.
                tx.execute(
                    "DELETE FROM worker_barrier_jobs WHERE barrier_id = $1",
                    &[&barrier_id],
                )
                .await?;
                tx.execute(
                    "UPDATE worker_barriers SET status = 'waiting', expected_count = $2, \
                     completed_count = 0, deadline_at = $3 WHERE id = $1",
                    &[&barrier_id, &(entries.len() as i32), &deadline],
                )
                .await?;
                barrier_id
            }
            None => {
                let barrier_id = Uuid::new_v4();
                tx.execute(
                    "INSERT INTO worker_barriers \
                     (id, run_id, expected_count, completed_count, status, deadline_at) \
                     VALUES ($1, $2, $3, 0, 'waiting', $4)",
                    &[&barrier_id, &run_id, &(entries.len() as i32), &deadline],
                )
                .await?;
                barrier_id
            }
        };

        for entry in entries {
            tx.execute(
                "INSERT INTO worker_barrier_jobs (barrier_id, job_id, tool_call_id, status) \
                 VALUES ($1, $2, $3, 'queued')",
                &[&barrier_id, &entry.job_id, &entry.tool_call_id],
            )
            .await?;
            tx.execute(
                "UPDATE worker_jobs SET status = 'queued' WHERE id = $1 AND status = 'created'",
                &[&entry.job_id],
            )
            .await?;
        }

        tx.execute(
            "UPDATE runs SET status = 'waiting' WHERE id = $1",
            &[&run_id],
        )
        .await?;

        let row = tx
            .query_one(
                format!("SELECT {BARRIER_COLUMNS} FROM worker_barriers WHERE id = $1").as_str(),
                &[&barrier_id],
            )
            .await?;
        let barrier = barrier_from_row(&row)?;

        tx.commit().await?;
        Ok(barrier)
    }

    async fn get_barrier(&self, run_id: Uuid) -> Result<Option<WorkerBarrier>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                format!("SELECT {BARRIER_COLUMNS} FROM worker_barriers WHERE run_id = $1").as_str(),
                &[&run_id],
            )
            .await?;
        row.as_ref().map(barrier_from_row).transpose()
    }

    async fn set_barrier_status(
        &self,
        run_id: Uuid,
        status: BarrierStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE worker_barriers SET status = $2 WHERE run_id = $1",
            &[&run_id, &status.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn complete_barrier_job(
        &self,
        run_id: Uuid,
        job_id: Uuid,
        result: &str,
        error: Option<&str>,
    ) -> Result<BarrierCompletion, StoreError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        // The row lock is the serializer for concurrent completions.
        let Some(barrier_row) = tx
            .query_opt(
                format!(
                    "SELECT {BARRIER_COLUMNS} FROM worker_barriers WHERE run_id = $1 FOR UPDATE"
                ).as_str(),
                &[&run_id],
            )
            .await?
        else {
            return Ok(BarrierCompletion::Skipped {
                reason: "no barrier found".to_string(),
            });
        };
        let barrier = barrier_from_row(&barrier_row)?;

        if barrier.status != BarrierStatus::Waiting {
            return Ok(BarrierCompletion::Skipped {
                reason: format!("barrier is {}, not waiting", barrier.status.as_str()),
            });
        }

        let Some(job_row) = tx
            .query_opt(
                format!(
                    "SELECT {BARRIER_JOB_COLUMNS} FROM worker_barrier_jobs \
                     WHERE barrier_id = $1 AND job_id = $2"
                ).as_str(),
                &[&barrier.id, &job_id],
            )
            .await?
        else {
            return Ok(BarrierCompletion::Skipped {
                reason: "no barrier job found".to_string(),
            });
        };
        let barrier_job = barrier_job_from_row(&job_row)?;
        if barrier_job.status.is_terminal() {
            return Ok(BarrierCompletion::Skipped {
                reason: format!("barrier job already {}", barrier_job.status.as_str()),
            });
        }

        let new_status = if error.is_some() { "failed" } else { "completed" };
        tx.execute(
            "UPDATE worker_barrier_jobs SET status = $3, result = $4, error = $5, \
             completed_at = NOW() WHERE barrier_id = $1 AND job_id = $2",
            &[&barrier.id, &job_id, &new_status, &result, &error],
        )
        .await?;

        let completed_row = tx
            .query_one(
                "UPDATE worker_barriers SET completed_count = completed_count + 1 \
                 WHERE id = $1 RETURNING completed_count, expected_count",
                &[&barrier.id],
            )
            .await?;
        let completed: i32 = completed_row.get("completed_count");
        let expected: i32 = completed_row.get("expected_count");

        if completed >= expected {
            tx.execute(
                "UPDATE worker_barriers SET status = 'resuming' WHERE id = $1",
                &[&barrier.id],
            )
            .await?;
            let rows = tx
                .query(
                    format!(
                        "SELECT {BARRIER_JOB_COLUMNS} FROM worker_barrier_jobs \
                         WHERE barrier_id = $1 ORDER BY completed_at NULLS LAST"
                    ).as_str(),
                    &[&barrier.id],
                )
                .await?;
            let batch: Result<Vec<BarrierJob>, StoreError> =
                rows.iter().map(barrier_job_from_row).collect();
            let batch = batch?;
            tx.commit().await?;
            Ok(BarrierCompletion::Resume { batch })
        } else {
            tx.commit().await?;
            Ok(BarrierCompletion::Waiting {
                completed,
                expected,
            })
        }
    }

    async fn expired_barriers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkerBarrier>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                format!(
                    "SELECT {BARRIER_COLUMNS} FROM worker_barriers \
                     WHERE status = 'waiting' AND deadline_at < $1"
                ).as_str(),
                &[&now],
            )
            .await?;
        rows.iter().map(barrier_from_row).collect()
    }

    async fn claim_expired_barrier(
        &self,
        barrier_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<BarrierJob>>, StoreError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        // NOWAIT: contention means another process owns this barrier.
        let locked = tx
            .query_opt(
                format!(
                    "SELECT {BARRIER_COLUMNS} FROM worker_barriers \
                     WHERE id = $1 FOR UPDATE NOWAIT"
                ).as_str(),
                &[&barrier_id],
            )
            .await;
        let row = match locked {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => {
                if e.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) {
                    return Ok(None);
                }
                return Err(e.into());
            }
        };
        let barrier = barrier_from_row(&row)?;
        if barrier.status != BarrierStatus::Waiting {
            return Ok(None);
        }

        tx.execute(
            "UPDATE worker_barriers SET status = 'resuming' WHERE id = $1",
            &[&barrier_id],
        )
        .await?;
        tx.execute(
            "UPDATE worker_barrier_jobs SET status = 'timeout', \
               error = 'Worker timed out (deadline exceeded)', completed_at = $2 \
             WHERE barrier_id = $1 AND status NOT IN ('completed', 'failed', 'timeout')",
            &[&barrier_id, &now],
        )
        .await?;

        let rows = tx
            .query(
                format!(
                    "SELECT {BARRIER_JOB_COLUMNS} FROM worker_barrier_jobs WHERE barrier_id = $1"
                ).as_str(),
                &[&barrier_id],
            )
            .await?;
        let batch: Result<Vec<BarrierJob>, StoreError> =
            rows.iter().map(barrier_job_from_row).collect();
        let batch = batch?;

        tx.commit().await?;
        Ok(Some(batch))
    }

    async fn append_event(
        &self,
        run_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<RunEvent, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO run_events (run_id, event_type, payload) VALUES ($1, $2, $3) \
                 RETURNING id, run_id, event_type, payload, created_at",
                &[&run_id, &event_type, &payload],
            )
            .await?;
        Ok(event_from_row(&row))
    }

    async fn events_after(&self, run_id: Uuid, after_id: i64) -> Result<Vec<RunEvent>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, run_id, event_type, payload, created_at FROM run_events \
                 WHERE run_id = $1 AND id > $2 ORDER BY id",
                &[&run_id, &after_id],
            )
            .await?;
        Ok(rows.iter().map(event_from_row).collect())
    }
}
