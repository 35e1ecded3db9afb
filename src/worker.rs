//! Worker job processor: claims queued jobs, runs the worker ReAct loop,
//! persists artifacts, and reports completions to the barrier coordinator.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::context::RunContext;
use crate::engine::{Engine, EngineDeps};
use crate::events::{EventBus, RunEmitter};
use crate::llm::ChatMessage;
use crate::model::{EventType, WorkerJob, WorkerJobStatus};
use crate::resume::ResumeService;
use crate::store::Store;
use crate::supervisor::prompt::build_worker_prompt;
use crate::tools::{LazyToolBinder, ToolRegistry};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Results longer than this get a clipped summary in the sidecar metadata.
const SUMMARY_THRESHOLD_CHARS: usize = 600;
const SUMMARY_CLIP_CHARS: usize = 300;

/// Polls the queue and executes worker jobs.
pub struct WorkerProcessor {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    deps: EngineDeps,
    registry: Arc<ToolRegistry>,
    resume: Arc<ResumeService>,
    engine_settings: EngineSettings,
    poll_interval: Duration,
}

impl WorkerProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        deps: EngineDeps,
        registry: Arc<ToolRegistry>,
        resume: Arc<ResumeService>,
        engine_settings: EngineSettings,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            deps,
            registry,
            resume,
            engine_settings,
            poll_interval,
        }
    }

    /// Start `concurrency` polling loops on background tasks.
    pub fn spawn(self: &Arc<Self>, concurrency: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..concurrency.max(1))
            .map(|slot| {
                let processor = self.clone();
                tokio::spawn(async move {
                    tracing::info!(slot, "Worker processor loop started");
                    processor.run_loop().await;
                })
            })
            .collect()
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            match self.store.claim_next_queued_job().await {
                Ok(Some(job)) => {
                    self.run_job(job).await;
                }
                Ok(None) => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    tracing::error!("Failed to claim worker job: {}", e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Execute one claimed job end to end.
    pub async fn run_job(&self, job: WorkerJob) {
        let start = Instant::now();
        let worker_id = format!("w-{}", Uuid::new_v4().simple());
        tracing::info!(
            job_id = %job.id,
            worker_id = %worker_id,
            "Running worker job: {}",
            crate::events::safe_preview(&job.task, 80)
        );

        // Worker events are tagged with the supervisor run so one stream
        // covers the whole delegation tree.
        let thread_id = self
            .store
            .get_run(job.supervisor_run_id)
            .await
            .ok()
            .flatten()
            .map(|r| r.thread_id)
            .unwrap_or_else(Uuid::nil);
        let ctx = RunContext {
            run_id: job.supervisor_run_id,
            owner_id: job.owner_id.clone(),
            thread_id,
            trace_id: job.trace_id.unwrap_or_else(Uuid::new_v4),
            message_id: Uuid::new_v4(),
            model: job.model.clone(),
            reasoning_effort: job.reasoning_effort.clone(),
        };
        let emitter = RunEmitter::new(self.bus.clone(), &ctx);

        let messages = vec![
            ChatMessage::system(build_worker_prompt()),
            ChatMessage::user(job.task.clone()),
        ];
        let mut binder = LazyToolBinder::eager(self.registry.clone());
        let engine = Engine::new(self.deps.clone(), emitter.clone(), self.engine_settings.clone());

        // The engine races a cancellation watcher: an observed `cancelled`
        // status aborts the loop cleanly between suspension points.
        let outcome = tokio::select! {
            outcome = engine.run(messages, &mut binder, &ctx) => Some(outcome),
            _ = watch_cancelled(self.store.clone(), job.id) => None,
        };

        let duration_ms = start.elapsed().as_millis() as i64;

        let (status, result, error) = match outcome {
            None => {
                tracing::info!(job_id = %job.id, "Worker job cancelled; aborting");
                (
                    WorkerJobStatus::Cancelled,
                    String::new(),
                    Some("Worker was cancelled".to_string()),
                )
            }
            Some(Err(e)) => {
                tracing::error!(job_id = %job.id, "Worker engine failed: {}", e);
                (WorkerJobStatus::Failed, String::new(), Some(e.to_string()))
            }
            Some(Ok(outcome)) => {
                let final_text = outcome
                    .final_assistant_text()
                    .unwrap_or("(No result)")
                    .to_string();

                let summary = if final_text.chars().count() > SUMMARY_THRESHOLD_CHARS {
                    Some(crate::events::safe_preview(&final_text, SUMMARY_CLIP_CHARS))
                } else {
                    None
                };

                let mut stored = true;
                if let Err(e) = self.deps.artifacts.put_result(&worker_id, &final_text).await {
                    tracing::error!(job_id = %job.id, "Failed to write result artifact: {}", e);
                    stored = false;
                }
                if let Err(e) = self
                    .deps
                    .artifacts
                    .put_metadata(
                        &worker_id,
                        &crate::artifacts::WorkerMetadata {
                            summary,
                            duration_ms,
                            usage: outcome.usage,
                        },
                    )
                    .await
                {
                    tracing::warn!(job_id = %job.id, "Failed to write metadata artifact: {}", e);
                }

                if stored {
                    (WorkerJobStatus::Success, final_text, None)
                } else {
                    (
                        WorkerJobStatus::Failed,
                        final_text,
                        Some("Failed to persist worker result artifact".to_string()),
                    )
                }
            }
        };

        if let Err(e) = self
            .store
            .finish_worker_job(job.id, status, Some(&worker_id), error.as_deref())
            .await
        {
            tracing::error!(job_id = %job.id, "Failed to finalize worker job: {}", e);
            return;
        }

        if let Err(e) = self
            .bus
            .emit(
                job.supervisor_run_id,
                EventType::WorkerComplete,
                json!({
                    "job_id": job.id,
                    "worker_id": worker_id,
                    "status": status.as_str(),
                    "duration_ms": duration_ms,
                    "error": error,
                    "owner_id": job.owner_id,
                }),
            )
            .await
        {
            tracing::warn!("Failed to emit worker_complete: {}", e);
        }

        // Hand the completion to the barrier; exactly one completion per
        // batch triggers the supervisor resume.
        let mut finished = job;
        finished.status = status;
        finished.worker_id = Some(worker_id);
        if let Err(e) = self
            .resume
            .handle_worker_completion(&finished, &result, error.as_deref())
            .await
        {
            tracing::error!(job_id = %finished.id, "Failed to report worker completion: {}", e);
        }
    }
}

/// Resolves when the job is observed in `cancelled` status.
async fn watch_cancelled(store: Arc<dyn Store>, job_id: Uuid) {
    loop {
        tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
        match store.get_worker_job(job_id).await {
            Ok(Some(job)) if job.status == WorkerJobStatus::Cancelled => return,
            Ok(Some(_)) => {}
            // Missing row or store failure: stop watching, let the engine run.
            Ok(None) => futures::future::pending::<()>().await,
            Err(e) => {
                tracing::warn!(job_id = %job_id, "Cancellation watch failed: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    }
}
