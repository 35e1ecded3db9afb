//! Worker delegation tools: spawn, wait, status, result readback, cancel.

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{NewWorkerJob, WorkerJobConfig, WorkerJobStatus};
use crate::tools::tool::{require_str, Suspension, Tool, ToolContext, ToolError, ToolOutput};

/// Spawn a background worker for a delegated task.
///
/// Execution suspends the supervisor: the dispatcher collects the
/// `WorkerSpawned` suspension and the lifecycle service installs a barrier
/// before any worker can start (two-phase commit). Idempotent by
/// (supervisor_run_id, tool_call_id): a retry after a crash reuses the
/// existing job, and a completed job short-circuits to its cached result.
pub struct SpawnWorkerTool;

#[async_trait]
impl Tool for SpawnWorkerTool {
    fn name(&self) -> &str {
        "spawn_worker"
    }

    fn description(&self) -> &str {
        "Spawn a background worker agent to execute a task. The worker runs \
         asynchronously; results are delivered back when it completes. Use one \
         call per independent task; multiple calls in one turn run in parallel."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Natural language description of what the worker should do"
                },
                "model": {
                    "type": "string",
                    "description": "Optional model override for the worker"
                },
                "git_repo": {
                    "type": "string",
                    "description": "Git repository URL for workspace-mode jobs"
                },
                "resume_session_id": {
                    "type": "string",
                    "description": "Workspace session to resume (workspace mode only)"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let task = require_str(&params, "task")?;
        let model_override = params.get("model").and_then(|v| v.as_str());

        // Idempotency by the spawning tool call.
        if let Some(existing) = ctx
            .store
            .find_job_by_tool_call(ctx.run.run_id, &ctx.tool_call_id)
            .await?
        {
            if existing.status == WorkerJobStatus::Success {
                if let Some(worker_id) = existing.worker_id.as_deref() {
                    if let Ok(result) = ctx.artifacts.best_result(worker_id).await {
                        return Ok(ToolOutput::text(format!(
                            "Worker job {} completed:\n\n{}",
                            existing.id, result
                        )));
                    }
                }
                // Success row without a readable artifact: recreate below.
            } else if !existing.status.is_terminal() {
                tracing::debug!(job_id = %existing.id, "Reusing existing worker job");
                return Err(ToolError::Suspend(Suspension::WorkerSpawned {
                    job_id: existing.id,
                    tool_call_id: ctx.tool_call_id.clone(),
                    task: existing.task.clone(),
                }));
            }
        }

        let config = params
            .get("git_repo")
            .and_then(|v| v.as_str())
            .map(|repo| WorkerJobConfig {
                git_repo: repo.to_string(),
                resume_session_id: params
                    .get("resume_session_id")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            });

        let job = ctx
            .store
            .create_worker_job(NewWorkerJob {
                owner_id: ctx.run.owner_id.clone(),
                supervisor_run_id: ctx.run.run_id,
                tool_call_id: ctx.tool_call_id.clone(),
                task: task.to_string(),
                model: model_override
                    .map(String::from)
                    .unwrap_or_else(|| ctx.run.model.clone()),
                reasoning_effort: ctx.run.reasoning_effort.clone(),
                trace_id: Some(ctx.run.trace_id),
                config,
            })
            .await?;

        tracing::info!(job_id = %job.id, run_id = %ctx.run.run_id, "Created worker job (status=created)");

        Err(ToolError::Suspend(Suspension::WorkerSpawned {
            job_id: job.id,
            tool_call_id: ctx.tool_call_id.clone(),
            task: task.to_string(),
        }))
    }
}

/// Block the supervisor on a specific worker.
///
/// Opt-in blocking; the async inbox model is preferred. Terminal jobs answer
/// inline, anything else suspends the run until the worker completes.
pub struct WaitForWorkerTool;

#[async_trait]
impl Tool for WaitForWorkerTool {
    fn name(&self) -> &str {
        "wait_for_worker"
    }

    fn description(&self) -> &str {
        "Wait for a specific worker job to complete (blocking). Use sparingly; \
         results normally arrive through the inbox."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "job_id": {
                    "type": "string",
                    "description": "The worker job id to wait for"
                }
            },
            "required": ["job_id"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let job_id = parse_job_id(&params)?;

        let Some(job) = ctx.store.get_worker_job(job_id).await? else {
            return Ok(ToolOutput::text(format!("Error: Worker job {} not found", job_id)));
        };
        if job.owner_id != ctx.run.owner_id {
            return Ok(ToolOutput::text(format!("Error: Worker job {} not found", job_id)));
        }

        match job.status {
            WorkerJobStatus::Cancelled => Ok(ToolOutput::text(format!(
                "Worker job {} was cancelled.",
                job_id
            ))),
            WorkerJobStatus::Failed | WorkerJobStatus::Timeout => Ok(ToolOutput::text(format!(
                "Worker job {} failed: {}",
                job_id,
                job.error.as_deref().unwrap_or("Unknown error")
            ))),
            WorkerJobStatus::Success => {
                let result = match job.worker_id.as_deref() {
                    Some(worker_id) => ctx
                        .artifacts
                        .best_result(worker_id)
                        .await
                        .unwrap_or_else(|_| "(result not found)".to_string()),
                    None => "(result not found)".to_string(),
                };
                Ok(ToolOutput::text(format!(
                    "Worker job {} completed:\n\n{}",
                    job_id, result
                )))
            }
            _ => Err(ToolError::Suspend(Suspension::WaitForWorker {
                job_id,
                tool_call_id: ctx.tool_call_id.clone(),
                message: format!("Waiting for worker job {} to complete...", job_id),
            })),
        }
    }
}

/// Inspect queued/running/completed workers for the owner.
pub struct CheckWorkerStatusTool;

#[async_trait]
impl Tool for CheckWorkerStatusTool {
    fn name(&self) -> &str {
        "check_worker_status"
    }

    fn description(&self) -> &str {
        "List the owner's active worker jobs and their status."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "job_id": {
                    "type": "string",
                    "description": "Optional specific job id to inspect"
                }
            },
            "required": []
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        if params.get("job_id").is_some() {
            let job_id = parse_job_id(&params)?;
            let Some(job) = ctx.store.get_worker_job(job_id).await? else {
                return Ok(ToolOutput::text(format!("Worker job {} not found", job_id)));
            };
            if job.owner_id != ctx.run.owner_id {
                return Ok(ToolOutput::text(format!("Worker job {} not found", job_id)));
            }
            return Ok(ToolOutput::json(serde_json::json!({
                "job_id": job.id,
                "status": job.status.as_str(),
                "task": job.task,
                "error": job.error,
            })));
        }

        let active = ctx.store.active_worker_jobs(&ctx.run.owner_id, 10).await?;
        if active.is_empty() {
            return Ok(ToolOutput::text("No active worker jobs."));
        }
        let jobs: Vec<serde_json::Value> = active
            .iter()
            .map(|j| {
                serde_json::json!({
                    "job_id": j.id,
                    "status": j.status.as_str(),
                    "task": j.task,
                })
            })
            .collect();
        Ok(ToolOutput::json(serde_json::json!({ "jobs": jobs })))
    }
}

/// Read the full stored result of a completed worker.
pub struct ReadWorkerResultTool;

#[async_trait]
impl Tool for ReadWorkerResultTool {
    fn name(&self) -> &str {
        "read_worker_result"
    }

    fn description(&self) -> &str {
        "Read the full result artifact of a completed worker job."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "job_id": {
                    "type": "string",
                    "description": "The worker job id"
                }
            },
            "required": ["job_id"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let job_id = parse_job_id(&params)?;
        let Some(job) = ctx.store.get_worker_job(job_id).await? else {
            return Ok(ToolOutput::text(format!("Worker job {} not found", job_id)));
        };
        if job.owner_id != ctx.run.owner_id {
            return Ok(ToolOutput::text(format!("Worker job {} not found", job_id)));
        }
        match job.worker_id.as_deref() {
            Some(worker_id) => match ctx.artifacts.get_result(worker_id).await {
                Ok(result) => Ok(ToolOutput::text(result)),
                Err(_) => Ok(ToolOutput::text(format!(
                    "Worker job {} has no stored result.",
                    job_id
                ))),
            },
            None => Ok(ToolOutput::text(format!(
                "Worker job {} has not produced a result yet (status: {}).",
                job_id, job.status
            ))),
        }
    }
}

/// Request cancellation of a queued or running worker.
pub struct CancelWorkerTool;

#[async_trait]
impl Tool for CancelWorkerTool {
    fn name(&self) -> &str {
        "cancel_worker"
    }

    fn description(&self) -> &str {
        "Cancel a queued or running worker job."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "job_id": {
                    "type": "string",
                    "description": "The worker job id to cancel"
                }
            },
            "required": ["job_id"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let job_id = parse_job_id(&params)?;
        let Some(job) = ctx.store.get_worker_job(job_id).await? else {
            return Ok(ToolOutput::text(format!("Worker job {} not found", job_id)));
        };
        if job.owner_id != ctx.run.owner_id {
            return Ok(ToolOutput::text(format!("Worker job {} not found", job_id)));
        }
        if job.status.is_terminal() {
            return Ok(ToolOutput::text(format!(
                "Worker job {} is already {}.",
                job_id, job.status
            )));
        }
        ctx.store
            .set_worker_job_status(job_id, WorkerJobStatus::Cancelled)
            .await?;
        Ok(ToolOutput::text(format!("Worker job {} cancelled.", job_id)))
    }
}

fn parse_job_id(params: &serde_json::Value) -> Result<Uuid, ToolError> {
    let raw = require_str(params, "job_id")?;
    raw.parse()
        .map_err(|_| ToolError::InvalidParameters(format!("invalid job id: {}", raw)))
}
