//! Supervisor lifecycle: find-or-create the per-owner thread, run a turn
//! with a shielded timeout, and hand interrupts to the barrier coordinator.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use uuid::Uuid;

use crate::barrier::BarrierCoordinator;
use crate::config::{EngineSettings, SupervisorSettings};
use crate::context::RunContext;
use crate::engine::{Engine, EngineDeps, Interrupt};
use crate::error::StoreError;
use crate::events::{EventBus, RunEmitter};
use crate::llm::{ChatMessage, Role};
use crate::model::{EventType, NewMessage, NewRun, Run, RunStatus, RunTrigger};
use crate::store::Store;
use crate::supervisor::inbox::{build_inbox_context, cleanup_stale_inbox};
use crate::supervisor::prompt::build_supervisor_prompt;
use crate::tools::{LazyToolBinder, ToolRegistry};

/// Request to start (or continue) a supervisor turn.
#[derive(Debug, Clone)]
pub struct SupervisorRequest {
    pub owner_id: String,
    pub task: String,
    /// Reuse a pre-created run row (continuation runs) instead of creating one.
    pub run_id: Option<Uuid>,
    pub message_id: Option<Uuid>,
    pub trace_id: Option<Uuid>,
    pub model_override: Option<String>,
    pub reasoning_effort: Option<String>,
    pub timeout: Option<Duration>,
    /// Internal orchestration prompts are stored for LLM context but hidden
    /// from user-visible history.
    pub internal: bool,
}

impl SupervisorRequest {
    pub fn new(owner_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            task: task.into(),
            run_id: None,
            message_id: None,
            trace_id: None,
            model_override: None,
            reasoning_effort: None,
            timeout: None,
            internal: false,
        }
    }
}

/// Outcome returned to the ingress caller.
#[derive(Debug, Clone)]
pub struct SupervisorRunResult {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

/// Orchestrates supervisor turns for all owners.
pub struct SupervisorService {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    deps: EngineDeps,
    registry: Arc<ToolRegistry>,
    coordinator: Arc<BarrierCoordinator>,
    engine_settings: EngineSettings,
    settings: SupervisorSettings,
    default_model: String,
    lazy_loading: bool,
}

impl SupervisorService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        deps: EngineDeps,
        registry: Arc<ToolRegistry>,
        coordinator: Arc<BarrierCoordinator>,
        engine_settings: EngineSettings,
        settings: SupervisorSettings,
        default_model: String,
    ) -> Self {
        Self {
            store,
            bus,
            deps,
            registry,
            coordinator,
            engine_settings,
            settings,
            default_model,
            lazy_loading: false,
        }
    }

    /// Enable lazy tool loading with catalog injection.
    pub fn with_lazy_loading(mut self, lazy: bool) -> Self {
        self.lazy_loading = lazy;
        self
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Run one supervisor turn.
    ///
    /// The engine call is wrapped in a *shielded* timeout: hitting the
    /// timeout stops waiting, not the work. The run transitions to DEFERRED
    /// and finishes normally in the background; a late worker result then
    /// arrives via a continuation run.
    pub async fn run_supervisor(
        self: &Arc<Self>,
        req: SupervisorRequest,
    ) -> Result<SupervisorRunResult, StoreError> {
        let start = Instant::now();
        let thread = self
            .store
            .find_or_create_supervisor_thread(&req.owner_id)
            .await?;

        let run = match req.run_id {
            Some(run_id) => {
                self.store
                    .get_run(run_id)
                    .await?
                    .ok_or(StoreError::NotFound {
                        entity: "run",
                        id: run_id.to_string(),
                    })?
            }
            None => {
                self.store
                    .create_run(NewRun {
                        owner_id: req.owner_id.clone(),
                        thread_id: thread.id,
                        status: RunStatus::Running,
                        trigger: RunTrigger::Api,
                        assistant_message_id: req.message_id.unwrap_or_else(Uuid::new_v4),
                        continuation_of_run_id: None,
                        root_run_id: None,
                        trace_id: req.trace_id.unwrap_or_else(Uuid::new_v4),
                        model: req
                            .model_override
                            .clone()
                            .unwrap_or_else(|| self.default_model.clone()),
                        reasoning_effort: req.reasoning_effort.clone(),
                        started_at: Some(Utc::now()),
                    })
                    .await?
            }
        };

        let ctx = RunContext {
            run_id: run.id,
            owner_id: req.owner_id.clone(),
            thread_id: thread.id,
            trace_id: run.trace_id,
            message_id: run.assistant_message_id,
            model: run.model.clone(),
            reasoning_effort: run.reasoning_effort.clone(),
        };
        let emitter = RunEmitter::new(self.bus.clone(), &ctx);

        tracing::info!(
            run_id = %run.id,
            owner_id = %req.owner_id,
            trace_id = %ctx.trace_id,
            "Starting supervisor run: {}",
            crate::events::safe_preview(&req.task, 80)
        );

        emitter
            .emit(
                EventType::SupervisorStarted,
                json!({"task": req.task, "thread_id": thread.id}),
            )
            .await;

        // Inject the inbox context before the user message, then acknowledge
        // only after the message is durably persisted (see-then-mark).
        let (_, survivor) = cleanup_stale_inbox(
            self.store.as_ref(),
            thread.id,
            self.settings.inbox_stale_after,
        )
        .await?;
        if let Some(inbox) = build_inbox_context(
            self.store.as_ref(),
            self.deps.artifacts.as_ref(),
            &req.owner_id,
        )
        .await?
        {
            // A fresh survivor with identical content means a concurrent
            // request already injected this exact view; don't duplicate it.
            if survivor.as_deref() != Some(inbox.content.as_str()) {
                self.store
                    .append_message(NewMessage::system(thread.id, inbox.content))
                    .await?;
            }
            if !inbox.acknowledge.is_empty() {
                self.store
                    .acknowledge_worker_jobs(&inbox.acknowledge)
                    .await?;
            }
        }

        self.store
            .append_message({
                let mut msg = NewMessage::user(thread.id, req.task.clone());
                msg.internal = req.internal;
                msg
            })
            .await?;

        emitter
            .emit(
                EventType::SupervisorThinking,
                json!({"message": "Analyzing your request..."}),
            )
            .await;

        // Shielded timeout: the spawned task owns the run to completion.
        let timeout = req.timeout.unwrap_or(self.settings.run_timeout);
        let service = self.clone();
        let task_run = run.clone();
        let task_ctx = ctx.clone();
        let task_emitter = emitter.clone();
        let mut handle = tokio::spawn(async move {
            service
                .execute_run(task_run, task_ctx, task_emitter, start)
                .await
        });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(join_err)) => {
                tracing::error!(run_id = %run.id, "Supervisor task panicked: {}", join_err);
                let duration_ms = start.elapsed().as_millis() as i64;
                self.store
                    .finish_run(
                        run.id,
                        RunStatus::Failed,
                        Some(&join_err.to_string()),
                        duration_ms,
                        None,
                    )
                    .await?;
                Ok(SupervisorRunResult {
                    run_id: run.id,
                    thread_id: thread.id,
                    status: RunStatus::Failed,
                    result: None,
                    error: Some(join_err.to_string()),
                    duration_ms,
                })
            }
            Err(_elapsed) => {
                // Timeout stops WAITING, not the work; the task keeps
                // running and finishes the run in the background.
                let duration_ms = start.elapsed().as_millis() as i64;
                let deferred = self
                    .store
                    .cas_run_status(run.id, RunStatus::Running, RunStatus::Deferred)
                    .await?;
                if !deferred {
                    // The task finished (or suspended) while we were timing
                    // out; report the actual state.
                    let current = self.store.get_run(run.id).await?;
                    if let Some(current) = current {
                        return Ok(SupervisorRunResult {
                            run_id: run.id,
                            thread_id: thread.id,
                            status: current.status,
                            result: None,
                            error: current.error,
                            duration_ms,
                        });
                    }
                }

                emitter
                    .emit(
                        EventType::SupervisorDeferred,
                        json!({
                            "thread_id": thread.id,
                            "message": "Still working on this in the background. I'll continue when ready.",
                            "timeout_seconds": timeout.as_secs(),
                        }),
                    )
                    .await;
                emitter
                    .emit(
                        EventType::RunUpdated,
                        json!({"status": "deferred", "thread_id": thread.id}),
                    )
                    .await;
                emitter
                    .emit_stream_control("keep_open", "deferred", Some(180_000), None)
                    .await;

                tracing::info!(
                    run_id = %run.id,
                    "Supervisor run deferred after {}s timeout (work continues)",
                    timeout.as_secs()
                );

                Ok(SupervisorRunResult {
                    run_id: run.id,
                    thread_id: thread.id,
                    status: RunStatus::Deferred,
                    result: Some(
                        "Still working on this in the background. I'll let you know when it's done."
                            .to_string(),
                    ),
                    error: None,
                    duration_ms,
                })
            }
        }
    }

    /// Drive the engine to completion or interrupt and finalize the run.
    /// Never fails: errors become a FAILED run with error events.
    async fn execute_run(
        self: Arc<Self>,
        run: Run,
        ctx: RunContext,
        emitter: RunEmitter,
        start: Instant,
    ) -> SupervisorRunResult {
        match self
            .execute_run_inner(&run, &ctx, &emitter, start)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                let duration_ms = start.elapsed().as_millis() as i64;
                tracing::error!(run_id = %run.id, "Supervisor run failed: {}", e);
                let message = e.to_string();
                if let Err(store_err) = self
                    .store
                    .finish_run(run.id, RunStatus::Failed, Some(&message), duration_ms, None)
                    .await
                {
                    tracing::error!(run_id = %run.id, "Failed to mark run failed: {}", store_err);
                }
                emitter
                    .emit(
                        EventType::Error,
                        json!({"message": message, "status": "error"}),
                    )
                    .await;
                emitter
                    .emit(
                        EventType::RunUpdated,
                        json!({"status": "failed", "error": message}),
                    )
                    .await;
                emitter
                    .emit_stream_control("close", "error", None, None)
                    .await;
                SupervisorRunResult {
                    run_id: run.id,
                    thread_id: run.thread_id,
                    status: RunStatus::Failed,
                    result: None,
                    error: Some(message),
                    duration_ms,
                }
            }
        }
    }

    async fn execute_run_inner(
        &self,
        run: &Run,
        ctx: &RunContext,
        emitter: &RunEmitter,
        start: Instant,
    ) -> Result<SupervisorRunResult, crate::error::EngineError> {
        let system_prompt = build_supervisor_prompt(&ctx.owner_id);
        let stored = self.store.thread_messages(run.thread_id).await?;
        let mut messages = Vec::with_capacity(stored.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(stored.iter().map(|m| m.to_chat()));
        let input_len = messages.len();

        let mut binder = if self.lazy_loading {
            LazyToolBinder::lazy(self.registry.clone())
        } else {
            LazyToolBinder::eager(self.registry.clone())
        };

        let engine = Engine::new(self.deps.clone(), emitter.clone(), self.engine_settings.clone());
        let outcome = engine.run(messages, &mut binder, ctx).await?;

        // Persist everything the engine produced beyond the input prefix.
        for msg in &outcome.messages[input_len..] {
            let mut row = NewMessage::from_chat(run.thread_id, msg);
            row.internal = msg.role == Role::System;
            self.store.append_message(row).await?;
        }

        let duration_ms = start.elapsed().as_millis() as i64;
        let total_tokens = outcome.usage.map(|u| u.total_tokens as i64);

        if let Some(interrupt) = &outcome.interrupt {
            // Two-phase commit: barrier + created→queued + run→WAITING in
            // one store transaction. Workers become observable only now.
            self.coordinator.install(run.id, interrupt).await?;
            if let Interrupt::WaitForWorker { tool_call_id, .. } = interrupt {
                self.store
                    .set_run_pending_tool_call(run.id, Some(tool_call_id))
                    .await?;
            }
            if let Some(tokens) = total_tokens {
                self.store.add_run_tokens(run.id, tokens).await?;
            }

            let job_ids = interrupt.job_ids();
            let message = format!(
                "Working on {} task(s) in the background...",
                job_ids.len()
            );
            emitter
                .emit(
                    EventType::SupervisorWaiting,
                    json!({"job_ids": job_ids, "message": message, "close_stream": false}),
                )
                .await;
            emitter
                .emit(
                    EventType::RunUpdated,
                    json!({"status": "waiting", "thread_id": run.thread_id}),
                )
                .await;
            emitter
                .emit_stream_control(
                    "keep_open",
                    "workers_pending",
                    Some(120_000),
                    Some(job_ids.len() as i64),
                )
                .await;

            return Ok(SupervisorRunResult {
                run_id: run.id,
                thread_id: run.thread_id,
                status: RunStatus::Waiting,
                result: Some(message),
                error: None,
                duration_ms,
            });
        }

        // Completed.
        let final_text = outcome
            .final_assistant_text()
            .unwrap_or("(No result)")
            .to_string();
        self.store
            .finish_run(run.id, RunStatus::Success, None, duration_ms, total_tokens)
            .await?;
        self.store.mark_messages_processed(run.thread_id).await?;

        emitter
            .emit(
                EventType::SupervisorComplete,
                json!({
                    "result": final_text,
                    "status": "success",
                    "duration_ms": duration_ms,
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

        let pending = self.store.pending_worker_count(run.id).await?;
        if pending > 0 {
            emitter
                .emit_stream_control("keep_open", "workers_pending", Some(120_000), Some(pending))
                .await;
        } else {
            emitter
                .emit_stream_control("close", "all_complete", None, None)
                .await;
        }

        Ok(SupervisorRunResult {
            run_id: run.id,
            thread_id: run.thread_id,
            status: RunStatus::Success,
            result: Some(final_text),
            error: None,
            duration_ms,
        })
    }
}
