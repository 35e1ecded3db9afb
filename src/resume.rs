//! Resume service: re-enters the engine after worker completions.
//!
//! Two entry paths: barrier completion while the run is WAITING (batch
//! resume with worker results injected as tool messages), and the inbox
//! continuation when results arrive after the run already ended.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::barrier::BarrierCoordinator;
use crate::config::{EngineSettings, SupervisorSettings};
use crate::context::RunContext;
use crate::engine::{Engine, EngineDeps};
use crate::error::StoreError;
use crate::events::{EventBus, RunEmitter};
use crate::llm::{ChatMessage, Role};
use crate::model::{
    BarrierJob, BarrierStatus, EventType, NewMessage, NewRun, Run, RunStatus, RunTrigger,
    WorkerJob,
};
use crate::store::Store;
use crate::supervisor::{prompt::build_supervisor_prompt, SupervisorRequest, SupervisorService};
use crate::tools::{LazyToolBinder, ToolRegistry};

/// Sentinel result meaning "updates were queued into the thread instead of
/// delivered directly"; the continuation prompt tells the supervisor to read
/// them there.
const QUEUED_UPDATES_RESULT: &str = "(Queued worker updates available in thread)";

const FOLLOWUP_BUDGET: Duration = Duration::from_secs(300);
const FOLLOWUP_SLEEP: Duration = Duration::from_millis(500);
const FOLLOWUP_MAX_SLEEP: Duration = Duration::from_secs(2);

/// Maximum characters of a worker result injected into a tool message; the
/// full artifact stays readable via `read_worker_result`.
const RESULT_CLIP_CHARS: usize = 4000;

const CONTINUATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Re-enters the engine with worker results.
pub struct ResumeService {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    deps: EngineDeps,
    registry: Arc<ToolRegistry>,
    coordinator: Arc<BarrierCoordinator>,
    supervisor: Arc<SupervisorService>,
    engine_settings: EngineSettings,
    settings: SupervisorSettings,
}

impl ResumeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        deps: EngineDeps,
        registry: Arc<ToolRegistry>,
        coordinator: Arc<BarrierCoordinator>,
        supervisor: Arc<SupervisorService>,
        engine_settings: EngineSettings,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            store,
            bus,
            deps,
            registry,
            coordinator,
            supervisor,
            engine_settings,
            settings,
        }
    }

    /// Entry point for every worker completion. Routes to the barrier (run
    /// still WAITING) or to an inbox continuation (run already terminal).
    pub async fn handle_worker_completion(
        self: &Arc<Self>,
        job: &WorkerJob,
        result: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let run_id = job.supervisor_run_id;

        let completion = self
            .coordinator
            .report_completion(run_id, job.id, result, error)
            .await?;

        match completion {
            crate::model::BarrierCompletion::Resume { batch } => {
                self.resume_batch(run_id, batch).await;
                Ok(())
            }
            crate::model::BarrierCompletion::Waiting { .. } => Ok(()),
            crate::model::BarrierCompletion::Skipped { reason } => {
                let Some(run) = self.store.get_run(run_id).await? else {
                    tracing::warn!(run_id = %run_id, "Worker completed for missing run");
                    return Ok(());
                };
                if run.status.is_terminal() {
                    // Late completion: the inbox model takes over.
                    self.trigger_continuation(run, job.clone(), result.to_string(), error.map(String::from))
                        .await;
                } else {
                    tracing::debug!(
                        run_id = %run_id,
                        job_id = %job.id,
                        "Completion not routed ({}); surfaces via inbox",
                        reason
                    );
                }
                Ok(())
            }
        }
    }

    /// Resume a WAITING run with a full batch of worker results. Exactly one
    /// caller reaches this per batch (barrier claim); the WAITING→RUNNING
    /// CAS is a second gate for crash-retry duplicates.
    pub async fn resume_batch(self: &Arc<Self>, run_id: Uuid, batch: Vec<BarrierJob>) {
        if let Err(e) = self.resume_batch_inner(run_id, batch).await {
            tracing::error!(run_id = %run_id, "Batch resume failed: {}", e);
            if let Err(store_err) = self.fail_run(run_id, &e.to_string()).await {
                tracing::error!(run_id = %run_id, "Failed to mark run failed: {}", store_err);
            }
        }
    }

    async fn resume_batch_inner(
        self: &Arc<Self>,
        run_id: Uuid,
        batch: Vec<BarrierJob>,
    ) -> Result<(), crate::error::EngineError> {
        let Some(run) = self.store.get_run(run_id).await? else {
            tracing::error!(run_id = %run_id, "Cannot resume: run not found");
            return Ok(());
        };

        if !self
            .store
            .cas_run_status(run_id, RunStatus::Waiting, RunStatus::Running)
            .await?
        {
            // Another resumer won; exit quietly.
            tracing::debug!(run_id = %run_id, "Skipping batch resume: run no longer waiting");
            return Ok(());
        }

        let ctx = RunContext {
            run_id: run.id,
            owner_id: run.owner_id.clone(),
            thread_id: run.thread_id,
            trace_id: run.trace_id,
            message_id: run.assistant_message_id,
            model: run.model.clone(),
            reasoning_effort: run.reasoning_effort.clone(),
        };
        let emitter = RunEmitter::new(self.bus.clone(), &ctx);

        tracing::info!(
            run_id = %run_id,
            batch = batch.len(),
            "Batch resuming supervisor run"
        );
        emitter
            .emit(
                EventType::SupervisorResumed,
                json!({"batch_size": batch.len(), "thread_id": run.thread_id}),
            )
            .await;

        // Inject one tool-response message per worker result, idempotently:
        // a tool message that already exists for the toolCallId is reused.
        for item in &batch {
            if self
                .store
                .find_tool_message(run.thread_id, &item.tool_call_id)
                .await?
                .is_some()
            {
                continue;
            }
            let artifact_result = self.artifact_result_for(item).await;
            let content = tool_message_content(item, artifact_result.as_deref());
            self.store
                .append_message(NewMessage {
                    thread_id: run.thread_id,
                    role: crate::model::Role::Tool,
                    content,
                    tool_calls: None,
                    tool_call_id: Some(item.tool_call_id.clone()),
                    processed: true,
                    internal: false,
                })
                .await?;
        }
        self.store.set_run_pending_tool_call(run_id, None).await?;

        // Re-enter the engine with the full history.
        let system_prompt = build_supervisor_prompt(&run.owner_id);
        let stored = self.store.thread_messages(run.thread_id).await?;
        let mut messages = Vec::with_capacity(stored.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(stored.iter().map(|m| m.to_chat()));
        let input_len = messages.len();

        let mut binder = LazyToolBinder::eager(self.registry.clone());
        let engine = Engine::new(self.deps.clone(), emitter.clone(), self.engine_settings.clone());
        let outcome = engine.run(messages, &mut binder, &ctx).await?;

        for msg in &outcome.messages[input_len..] {
            let mut row = NewMessage::from_chat(run.thread_id, msg);
            row.internal = msg.role == Role::System;
            self.store.append_message(row).await?;
        }

        let duration_ms = duration_since(&run);
        let total_tokens = outcome.usage.map(|u| u.total_tokens as i64);

        if let Some(interrupt) = &outcome.interrupt {
            // The engine spawned more workers: reuse the barrier (stale
            // barrier-jobs pruned in the install transaction) and go back
            // to WAITING.
            self.coordinator.install(run_id, interrupt).await?;
            if let Some(tokens) = total_tokens {
                self.store.add_run_tokens(run_id, tokens).await?;
            }
            let job_ids = interrupt.job_ids();
            emitter
                .emit(
                    EventType::SupervisorWaiting,
                    json!({
                        "job_ids": job_ids,
                        "message": format!("Working on {} more task(s) in the background...", job_ids.len()),
                        "close_stream": false,
                    }),
                )
                .await;
            emitter
                .emit(EventType::RunUpdated, json!({"status": "waiting"}))
                .await;
            return Ok(());
        }

        // Completed.
        let final_text = outcome
            .final_assistant_text()
            .unwrap_or("(No result)")
            .to_string();
        self.store
            .finish_run(run_id, RunStatus::Success, None, duration_ms, total_tokens)
            .await?;
        self.store
            .set_barrier_status(run_id, BarrierStatus::Completed)
            .await?;
        self.store.mark_messages_processed(run.thread_id).await?;

        emitter
            .emit(
                EventType::SupervisorComplete,
                json!({
                    "result": final_text,
                    "status": "success",
                    "duration_ms": duration_ms,
                    "batch_size": batch.len(),
                    "usage": outcome.usage,
                }),
            )
            .await;
        emitter
            .emit(
                EventType::RunUpdated,
                json!({
                    "status": "success",
                    "finished_at": Utc::now().to_rfc3339(),
                    "duration_ms": duration_ms,
                }),
            )
            .await;

        let pending = self.store.pending_worker_count(run_id).await?;
        if pending > 0 {
            emitter
                .emit_stream_control("keep_open", "workers_pending", Some(120_000), Some(pending))
                .await;
        } else {
            emitter
                .emit_stream_control("close", "all_complete", None, None)
                .await;
        }

        tracing::info!(run_id = %run_id, "Successfully batch resumed supervisor run");
        Ok(())
    }

    /// The worker's preferred result from the artifact store: the sidecar
    /// summary when one exists, else the full result. The barrier row only
    /// caches the raw text, so the summary has to come from here.
    async fn artifact_result_for(&self, item: &BarrierJob) -> Option<String> {
        if item.error.is_some() {
            return None;
        }
        let job = self.store.get_worker_job(item.job_id).await.ok().flatten()?;
        let worker_id = job.worker_id?;
        self.deps.artifacts.best_result(&worker_id).await.ok()
    }

    async fn fail_run(&self, run_id: Uuid, message: &str) -> Result<(), StoreError> {
        let duration_ms = self
            .store
            .get_run(run_id)
            .await?
            .as_ref()
            .map(duration_since)
            .unwrap_or(0);
        self.store
            .finish_run(run_id, RunStatus::Failed, Some(message), duration_ms, None)
            .await?;
        self.store
            .set_barrier_status(run_id, BarrierStatus::Failed)
            .await?;
        if let Err(e) = self
            .bus
            .emit(
                run_id,
                EventType::Error,
                json!({"message": message, "status": "error"}),
            )
            .await
        {
            tracing::warn!("Failed to emit error event: {}", e);
        }
        let _ = self
            .bus
            .emit(
                run_id,
                EventType::StreamControl,
                json!({"action": "close", "reason": "error", "run_id": run_id}),
            )
            .await;
        Ok(())
    }

    /// Create a continuation run for a worker result that arrived after the
    /// original run ended. Continuations chain; the chain shares the
    /// original's root_run_id and is bounded in depth.
    pub async fn trigger_continuation(
        self: &Arc<Self>,
        original: Run,
        job: WorkerJob,
        result: String,
        error: Option<String>,
    ) {
        let mut parent = original;

        // Resolve the chain tail, merging into a running continuation or
        // chaining off a finished one.
        loop {
            match self.store.find_continuation_run(parent.id).await {
                Ok(Some(existing)) => {
                    if existing.status == RunStatus::Running
                        || existing.status == RunStatus::Waiting
                        || existing.status == RunStatus::Queued
                    {
                        // Queue the update into the thread and follow up
                        // once the in-flight continuation settles.
                        tracing::info!(
                            job_id = %job.id,
                            continuation = %existing.id,
                            "Queueing worker update behind in-flight continuation"
                        );
                        self.queue_worker_update(&parent, &job, &result, error.as_deref())
                            .await;
                        self.schedule_followup_after_run(existing.id, parent.clone(), job.clone());
                        return;
                    }
                    // Terminal: chain off it.
                    parent = existing;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Continuation lookup failed: {}", e);
                    return;
                }
            }
        }

        if chain_depth(self.store.as_ref(), &parent).await
            >= self.settings.continuation_depth_limit
        {
            tracing::warn!(
                run_id = %parent.id,
                "Continuation depth limit reached; result will surface via inbox only"
            );
            return;
        }

        let root_run_id = parent.root_run_id.unwrap_or(parent.id);
        let continuation = match self
            .store
            .create_run(NewRun {
                owner_id: parent.owner_id.clone(),
                thread_id: parent.thread_id,
                status: RunStatus::Running,
                trigger: RunTrigger::Continuation,
                assistant_message_id: Uuid::new_v4(),
                continuation_of_run_id: Some(parent.id),
                root_run_id: Some(root_run_id),
                trace_id: Uuid::new_v4(),
                model: parent.model.clone(),
                reasoning_effort: parent.reasoning_effort.clone(),
                started_at: Some(Utc::now()),
            })
            .await
        {
            Ok(run) => run,
            Err(e) => {
                tracing::error!("Failed to create continuation run: {}", e);
                return;
            }
        };

        tracing::info!(
            continuation = %continuation.id,
            original = %parent.id,
            job_id = %job.id,
            "Created inbox continuation run"
        );

        let _ = self
            .bus
            .emit(
                parent.id,
                EventType::StreamControl,
                json!({
                    "action": "keep_open",
                    "reason": "continuation_start",
                    "run_id": parent.id,
                    "ttl_ms": 180_000,
                    "continuation_run_id": continuation.id,
                }),
            )
            .await;

        let synthetic_task = synthetic_continuation_task(&job, &result, error.as_deref());
        let request = SupervisorRequest {
            owner_id: parent.owner_id.clone(),
            task: synthetic_task,
            run_id: Some(continuation.id),
            message_id: None,
            trace_id: None,
            model_override: None,
            reasoning_effort: None,
            timeout: Some(CONTINUATION_TIMEOUT),
            internal: true,
        };
        match self.supervisor.run_supervisor(request).await {
            Ok(result) => {
                tracing::info!(
                    continuation = %continuation.id,
                    status = %result.status,
                    "Inbox continuation run finished"
                );
            }
            Err(e) => {
                tracing::error!(continuation = %continuation.id, "Continuation run failed: {}", e);
            }
        }
    }

    /// Record a worker update into the thread as an internal system note.
    async fn queue_worker_update(
        &self,
        run: &Run,
        job: &WorkerJob,
        result: &str,
        error: Option<&str>,
    ) {
        let status = if error.is_some() { "failed" } else { "completed" };
        let body = error.unwrap_or(result);
        let content = format!(
            "[Worker update] Job {} {} while another response was running.\nTask: {}\n{}",
            job.id,
            status,
            crate::events::safe_preview(&job.task, 200),
            crate::events::safe_preview(body, RESULT_CLIP_CHARS),
        );
        let msg = NewMessage::system(run.thread_id, content);
        if let Err(e) = self.store.append_message(msg).await {
            tracing::error!("Failed to queue worker update: {}", e);
        }
    }

    /// After an in-flight continuation settles, fire a follow-up continuation
    /// pointing the supervisor at the queued updates. Polls with capped
    /// backoff inside a fixed budget.
    fn schedule_followup_after_run(self: &Arc<Self>, run_id: Uuid, parent: Run, job: WorkerJob) {
        let service = self.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + FOLLOWUP_BUDGET;
            let mut sleep = FOLLOWUP_SLEEP;
            loop {
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(run_id = %run_id, "Follow-up budget exhausted; giving up");
                    return;
                }
                match service.store.get_run(run_id).await {
                    Ok(Some(run)) if run.status.is_terminal() => break,
                    Ok(Some(_)) => {}
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!("Follow-up poll failed: {}", e);
                        return;
                    }
                }
                tokio::time::sleep(sleep).await;
                sleep = (sleep * 2).min(FOLLOWUP_MAX_SLEEP);
            }
            service
                .trigger_continuation(parent, job, QUEUED_UPDATES_RESULT.to_string(), None)
                .await;
        });
    }
}

/// Content of the synthesized tool message for one barrier job: the
/// artifact summary when present, else the truncated cached result, else an
/// error message.
fn tool_message_content(item: &BarrierJob, artifact_result: Option<&str>) -> String {
    if let Some(error) = item.error.as_deref() {
        return format!("<tool-error> Worker failed: {}", error);
    }
    if let Some(best) = artifact_result {
        if !best.trim().is_empty() {
            return crate::events::safe_preview(best, RESULT_CLIP_CHARS);
        }
    }
    match item.result.as_deref() {
        Some(result) if !result.trim().is_empty() => {
            crate::events::safe_preview(result, RESULT_CLIP_CHARS)
        }
        _ => "(Worker produced no result)".to_string(),
    }
}

fn duration_since(run: &Run) -> i64 {
    run.started_at
        .map(|s| (Utc::now() - s).num_milliseconds().max(0))
        .unwrap_or(0)
}

/// Depth of the continuation chain ending at `run` (0 for a root run).
async fn chain_depth(store: &dyn Store, run: &Run) -> u32 {
    let mut depth = 0;
    let mut current = run.continuation_of_run_id;
    while let Some(prev_id) = current {
        depth += 1;
        if depth >= 64 {
            break;
        }
        current = match store.get_run(prev_id).await {
            Ok(Some(prev)) => prev.continuation_of_run_id,
            _ => None,
        };
    }
    depth
}

/// Synthetic prompt for a continuation run.
fn synthetic_continuation_task(job: &WorkerJob, result: &str, error: Option<&str>) -> String {
    if result == QUEUED_UPDATES_RESULT {
        return "[Worker inbox] One or more background workers completed while another \
                response was running.\n\nPlease review the latest internal worker updates \
                in the thread and summarize them clearly for the user."
            .to_string();
    }
    match error {
        Some(error) => format!(
            "[Worker inbox] A background worker failed.\n\nOriginal task: {}\n\nError: {}\n\n\
             Please acknowledge the failure and explain what happened to the user.",
            crate::events::safe_preview(&job.task, 200),
            error
        ),
        None => format!(
            "[Worker inbox] A background worker has completed and returned results.\n\n\
             Original task: {}\n\nWorker result:\n{}\n\n\
             Please synthesize these findings and present them clearly to the user.",
            crate::events::safe_preview(&job.task, 200),
            result
        ),
    }
}

/// Periodic reaper: enforces barrier deadlines and cleans up orphaned jobs.
/// Each claimed barrier gets a normal batch resume with partial results.
pub fn spawn_reaper(
    coordinator: Arc<BarrierCoordinator>,
    resume: Arc<ResumeService>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh process does
        // not reap barriers installed microseconds ago by a predecessor.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match coordinator.reap_cycle().await {
                Ok(stats) => {
                    for (run_id, batch) in stats.claimed {
                        resume.resume_batch(run_id, batch).await;
                    }
                }
                Err(e) => {
                    tracing::error!("Reaper cycle failed: {}", e);
                }
            }
        }
    })
}
