//! The ReAct engine: model ↔ tool loop with bounded iterations.
//!
//! One engine instance drives one run. The engine persists nothing; it
//! returns the full message history and the caller diffs against its input.
//! Suspension (spawned workers, blocking waits) comes back as a typed
//! `Interrupt` on the outcome, never as an error.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::time::Instant;

use crate::artifacts::{output_marker, truncate_head_tail, ArtifactStore, ToolOutputStore};
use crate::config::EngineSettings;
use crate::context::RunContext;
use crate::engine::interrupt::{EngineOutcome, Interrupt, SpawnedJob};
use crate::engine::trim::trim_messages;
use crate::engine::usage::UsageAccumulator;
use crate::error::EngineError;
use crate::events::{safe_preview, RunEmitter};
use crate::llm::{
    ChatMessage, LlmProvider, Role, ToolCall, ToolCompletionRequest, ToolCompletionResponse,
};
use crate::model::EventType;
use crate::store::Store;
use crate::tools::builtin::MAX_TOOLS_FROM_SEARCH;
use crate::tools::{LazyToolBinder, Suspension, Tool, ToolContext, ToolError};

/// Hard cap on tool-iteration rounds per engine invocation.
pub const MAX_REACT_ITERATIONS: usize = 50;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

const EMPTY_RESPONSE_REMINDER: &str = "Your previous response was empty. You MUST either:\n\
     1) Call the appropriate tool(s), OR\n\
     2) Provide a final answer.\n\n\
     Do not return an empty message.";

/// Shared dependencies the engine needs beyond the conversation itself.
#[derive(Clone)]
pub struct EngineDeps {
    pub llm: Arc<dyn LlmProvider>,
    pub store: Arc<dyn Store>,
    pub artifacts: Arc<ArtifactStore>,
    pub outputs: Arc<ToolOutputStore>,
}

/// One engine per run.
pub struct Engine {
    deps: EngineDeps,
    emitter: RunEmitter,
    settings: EngineSettings,
}

/// Result of dispatching one turn's tool calls.
struct ToolDispatch {
    messages: Vec<ChatMessage>,
    interrupt: Option<Interrupt>,
    critical: Option<String>,
}

enum SingleOutcome {
    Content(String),
    Error(String),
    Critical(String),
    Suspend(Suspension),
}

impl Engine {
    pub fn new(deps: EngineDeps, emitter: RunEmitter, settings: EngineSettings) -> Self {
        Self {
            deps,
            emitter,
            settings,
        }
    }

    /// Run the loop until the model produces a final answer or suspends.
    pub async fn run(
        &self,
        messages: Vec<ChatMessage>,
        binder: &mut LazyToolBinder,
        ctx: &RunContext,
    ) -> Result<EngineOutcome, EngineError> {
        let mut current = messages;
        let mut usage = UsageAccumulator::new();

        if binder.is_lazy() {
            self.inject_catalog(&mut current, binder);
        }

        // Resume detection: pending tool calls on the trailing assistant
        // message run before any model call, so resume is idempotent.
        let pending = pending_tool_calls(&current);
        let mut llm_response = if !pending.is_empty() {
            tracing::info!(
                run_id = %ctx.run_id,
                count = pending.len(),
                "Resuming with pending tool call(s)"
            );
            let dispatch = self.dispatch_tools(&pending, binder, ctx).await?;
            let rebind_names = collect_search_results(&dispatch.messages);

            current.extend(dispatch.messages);
            // Critical first: a configuration failure stops the run even if
            // the same batch also produced an interrupt.
            if let Some(error) = dispatch.critical {
                if let Some(interrupt) = &dispatch.interrupt {
                    abort_pending_interrupt(&mut current, interrupt);
                }
                current.push(fail_fast_message(&error));
                return Ok(EngineOutcome {
                    messages: current,
                    usage: usage.total(),
                    interrupt: None,
                });
            }
            if let Some(interrupt) = dispatch.interrupt {
                return Ok(EngineOutcome {
                    messages: current,
                    usage: usage.total(),
                    interrupt: Some(interrupt),
                });
            }
            self.rebind_after_search(binder, &rebind_names);
            self.call_llm(&current, binder, ctx, None, "resume_synthesis", &mut usage)
                .await?
        } else {
            self.call_llm(&current, binder, ctx, None, "initial", &mut usage)
                .await?
        };

        // Empty-response recovery: one forced retry, then a concrete error.
        if llm_response.is_empty() {
            tracing::warn!(run_id = %ctx.run_id, "Model produced empty response; retrying once");
            current.push(ChatMessage::system(EMPTY_RESPONSE_REMINDER));
            let tool_choice = if binder.bound_definitions().is_empty() {
                None
            } else {
                Some("required".to_string())
            };
            llm_response = self
                .call_llm(&current, binder, ctx, tool_choice, "empty_retry", &mut usage)
                .await?;

            if llm_response.is_empty() {
                tracing::error!(run_id = %ctx.run_id, "Model produced empty response after retry");
                current.push(ChatMessage::assistant(
                    "Error: the model returned an empty response twice. \
                     This is a provider or model issue.",
                ));
                return Ok(EngineOutcome {
                    messages: current,
                    usage: usage.total(),
                    interrupt: None,
                });
            }
        }

        let mut iteration = 0usize;
        while !llm_response.tool_calls.is_empty() {
            iteration += 1;
            if iteration > MAX_REACT_ITERATIONS {
                tracing::error!(
                    run_id = %ctx.run_id,
                    "ReAct loop exceeded {} iterations; stopping",
                    MAX_REACT_ITERATIONS
                );
                current.push(ChatMessage::assistant(format!(
                    "Error: exceeded maximum of {} tool iterations. \
                     This may indicate a loop or an overly complex task.",
                    MAX_REACT_ITERATIONS
                )));
                return Ok(EngineOutcome {
                    messages: current,
                    usage: usage.total(),
                    interrupt: None,
                });
            }

            current.push(ChatMessage::assistant_with_tool_calls(
                llm_response.content.clone().unwrap_or_default(),
                llm_response.tool_calls.clone(),
            ));

            let dispatch = self
                .dispatch_tools(&llm_response.tool_calls, binder, ctx)
                .await?;
            let rebind_names = collect_search_results(&dispatch.messages);

            current.extend(dispatch.messages);

            // Critical first: a same-turn spawn must not mask the fail-fast.
            if let Some(error) = dispatch.critical {
                if let Some(interrupt) = &dispatch.interrupt {
                    abort_pending_interrupt(&mut current, interrupt);
                }
                current.push(fail_fast_message(&error));
                return Ok(EngineOutcome {
                    messages: current,
                    usage: usage.total(),
                    interrupt: None,
                });
            }

            if let Some(interrupt) = dispatch.interrupt {
                // Non-spawn results are already in the batch; spawn calls get
                // their tool messages on resume.
                return Ok(EngineOutcome {
                    messages: current,
                    usage: usage.total(),
                    interrupt: Some(interrupt),
                });
            }

            self.rebind_after_search(binder, &rebind_names);

            llm_response = self
                .call_llm(&current, binder, ctx, None, "tool_iteration", &mut usage)
                .await?;
        }

        current.push(ChatMessage::assistant(
            llm_response.content.unwrap_or_default(),
        ));

        Ok(EngineOutcome {
            messages: current,
            usage: usage.total(),
            interrupt: None,
        })
    }

    /// One model call with heartbeats and usage accounting.
    async fn call_llm(
        &self,
        messages: &[ChatMessage],
        binder: &LazyToolBinder,
        ctx: &RunContext,
        tool_choice: Option<String>,
        phase: &str,
        usage: &mut UsageAccumulator,
    ) -> Result<ToolCompletionResponse, EngineError> {
        let trimmed = trim_messages(
            messages,
            self.settings.max_user_turns,
            self.settings.max_chars,
        );

        let heartbeat = {
            let emitter = self.emitter.clone();
            let phase = phase.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                    emitter
                        .emit(
                            EventType::SupervisorHeartbeat,
                            json!({"activity": "llm_reasoning", "phase": phase}),
                        )
                        .await;
                }
            })
        };

        let request = ToolCompletionRequest {
            model: ctx.model.clone(),
            messages: trimmed,
            tools: binder.bound_definitions(),
            tool_choice,
            reasoning_effort: ctx.reasoning_effort.clone(),
            max_tokens: None,
            temperature: None,
        };

        let result = self.deps.llm.complete_with_tools(request).await;
        heartbeat.abort();
        let response = result?;

        usage.observe(response.usage.as_ref());

        if self.settings.stream_tokens {
            if let Some(content) = response.content.as_deref() {
                if !content.trim().is_empty() {
                    self.emitter
                        .emit(EventType::SupervisorToken, json!({"chunk": content}))
                        .await;
                }
            }
        }

        Ok(response)
    }

    /// Execute a turn's tool calls: non-spawn tools concurrently, spawn
    /// calls collected afterwards for the two-phase commit.
    async fn dispatch_tools(
        &self,
        calls: &[ToolCall],
        binder: &LazyToolBinder,
        ctx: &RunContext,
    ) -> Result<ToolDispatch, EngineError> {
        let spawn_calls: Vec<&ToolCall> =
            calls.iter().filter(|tc| tc.name == "spawn_worker").collect();
        let other_calls: Vec<&ToolCall> =
            calls.iter().filter(|tc| tc.name != "spawn_worker").collect();

        let mut messages = Vec::new();
        let mut critical = None;
        let mut wait_suspension: Option<Suspension> = None;

        // Phase 1: non-spawn tools, concurrently, results in call order.
        let futures: Vec<_> = other_calls
            .iter()
            .map(|tc| self.execute_single((*tc).clone(), binder.get(&tc.name), ctx))
            .collect();
        let outcomes = join_all(futures).await;

        for (tc, outcome) in other_calls.iter().zip(outcomes) {
            match outcome {
                SingleOutcome::Content(content) | SingleOutcome::Error(content) => {
                    messages.push(ChatMessage::tool_result(&tc.id, &tc.name, content));
                }
                SingleOutcome::Critical(content) => {
                    messages.push(ChatMessage::tool_result(&tc.id, &tc.name, content.clone()));
                    critical.get_or_insert(content);
                }
                SingleOutcome::Suspend(s) => {
                    // wait_for_worker: no tool message yet; the response is
                    // injected on resume under the same tool_call_id.
                    wait_suspension.get_or_insert(s);
                }
            }
        }

        // Phase 2: spawn calls, sequentially, in call order.
        let mut created: Vec<SpawnedJob> = Vec::new();
        for tc in &spawn_calls {
            let outcome = self
                .execute_single((*tc).clone(), binder.get(&tc.name), ctx)
                .await;
            match outcome {
                SingleOutcome::Content(content) | SingleOutcome::Error(content) => {
                    // Cached result or spawn failure: answer inline.
                    messages.push(ChatMessage::tool_result(&tc.id, &tc.name, content));
                }
                SingleOutcome::Critical(content) => {
                    messages.push(ChatMessage::tool_result(&tc.id, &tc.name, content.clone()));
                    critical.get_or_insert(content);
                }
                SingleOutcome::Suspend(Suspension::WorkerSpawned {
                    job_id,
                    tool_call_id,
                    task,
                }) => {
                    created.push(SpawnedJob {
                        job_id,
                        tool_call_id,
                        task,
                    });
                }
                SingleOutcome::Suspend(other) => {
                    tracing::warn!("Unexpected suspension from spawn call: {:?}", other);
                }
            }
        }

        let interrupt = if !created.is_empty() {
            // A blocking wait in the same turn joins the batch so its
            // tool_call_id still receives a response on resume.
            if let Some(Suspension::WaitForWorker {
                job_id,
                tool_call_id,
                ..
            }) = wait_suspension
            {
                created.push(SpawnedJob {
                    job_id,
                    tool_call_id,
                    task: String::new(),
                });
            }
            Some(Interrupt::WorkersPending { created })
        } else {
            wait_suspension.map(|s| match s {
                Suspension::WaitForWorker {
                    job_id,
                    tool_call_id,
                    message,
                } => Interrupt::WaitForWorker {
                    job_id,
                    tool_call_id,
                    message,
                },
                Suspension::WorkerSpawned {
                    job_id,
                    tool_call_id,
                    task,
                } => Interrupt::WorkersPending {
                    created: vec![SpawnedJob {
                        job_id,
                        tool_call_id,
                        task,
                    }],
                },
            })
        };

        Ok(ToolDispatch {
            messages,
            interrupt,
            critical,
        })
    }

    /// Execute one tool call in its own task so a panic becomes a
    /// `<tool-error>` message instead of tearing down the turn.
    async fn execute_single(
        &self,
        call: ToolCall,
        tool: Option<Arc<dyn Tool>>,
        ctx: &RunContext,
    ) -> SingleOutcome {
        let emitter = self.emitter.clone();
        let tool_ctx = ToolContext {
            run: ctx.clone(),
            store: self.deps.store.clone(),
            artifacts: self.deps.artifacts.clone(),
            outputs: self.deps.outputs.clone(),
            tool_call_id: call.id.clone(),
        };
        let max_output = self.settings.max_tool_output_chars;
        let outputs = self.deps.outputs.clone();

        emitter
            .emit_tool_started(
                &call.name,
                &call.id,
                &safe_preview(&call.arguments.to_string(), 200),
            )
            .await;
        let start = Instant::now();

        let Some(tool) = tool else {
            let content = format!("Error: Tool '{}' not found.", call.name);
            tracing::error!("{}", content);
            emitter
                .emit_tool_failed(&call.name, &call.id, elapsed_ms(start), &content)
                .await;
            return SingleOutcome::Error(content);
        };

        let args = call.arguments.clone();
        let handle =
            tokio::spawn(async move { tool.execute(args, &tool_ctx).await });

        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                // Panicked tool.
                let content = format!("<tool-error> tool panicked: {}", join_err);
                tracing::error!("Tool {} panicked: {}", call.name, join_err);
                emitter
                    .emit_tool_failed(&call.name, &call.id, elapsed_ms(start), &content)
                    .await;
                return SingleOutcome::Error(content);
            }
        };

        let duration_ms = elapsed_ms(start);
        match result {
            Ok(output) => {
                let mut content = output.into_content();
                if content.len() > max_output {
                    content = match outputs.put(&content).await {
                        Ok(artifact_id) => {
                            let marker = output_marker(&artifact_id, content.len());
                            let preview = truncate_head_tail(&content, max_output, 1024);
                            format!("{}\n{}", preview, marker)
                        }
                        Err(e) => {
                            tracing::warn!("Failed to offload tool output: {}", e);
                            truncate_head_tail(&content, max_output, 1024)
                        }
                    };
                }
                emitter
                    .emit_tool_completed(
                        &call.name,
                        &call.id,
                        duration_ms,
                        &safe_preview(&content, 200),
                    )
                    .await;
                SingleOutcome::Content(content)
            }
            Err(ToolError::Suspend(suspension)) => {
                emitter
                    .emit_tool_completed(&call.name, &call.id, duration_ms, "suspended")
                    .await;
                SingleOutcome::Suspend(suspension)
            }
            Err(ToolError::Critical(msg)) => {
                emitter
                    .emit_tool_failed(&call.name, &call.id, duration_ms, &msg)
                    .await;
                SingleOutcome::Critical(format!("<tool-error> {}", msg))
            }
            Err(err) => {
                let content = format!("<tool-error> {}", err);
                tracing::error!("Error executing tool {}: {}", call.name, err);
                emitter
                    .emit_tool_failed(&call.name, &call.id, duration_ms, &safe_preview(&content, 500))
                    .await;
                SingleOutcome::Error(content)
            }
        }
    }

    /// Bind tools discovered by `search_tools` before the next model call so
    /// the model can actually invoke them.
    fn rebind_after_search(&self, binder: &mut LazyToolBinder, names: &[String]) {
        if !binder.is_lazy() || names.is_empty() {
            return;
        }
        let loaded = binder.load_tools(names);
        if binder.needs_rebind() {
            binder.clear_rebind_flag();
            tracing::info!(
                "Rebound after search_tools; loaded={:?}, total bound={}",
                loaded,
                binder.bound_definitions().len()
            );
        }
    }

    /// Append the tool catalog to the leading system message so the model
    /// knows what it can discover through `search_tools`.
    fn inject_catalog(&self, messages: &mut [ChatMessage], binder: &LazyToolBinder) {
        let catalog = binder.catalog_for_prompt();
        if catalog.is_empty() {
            return;
        }
        if let Some(first) = messages.first_mut() {
            if first.role == Role::System {
                let core = binder.loaded_names().join(", ");
                first.content.push_str(&format!(
                    "\n\n## Available Tools\nCore tools are always available: {}.\n\
                     For other tools, first call `search_tools` with a query describing \
                     what you need; matching tools become callable on your next turn.\n{}",
                    core, catalog
                ));
            }
        }
    }
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

fn fail_fast_message(error: &str) -> ChatMessage {
    ChatMessage::assistant(format!(
        "I stopped early because of a configuration problem that I cannot \
         work around: {}",
        error.trim_start_matches("<tool-error> ")
    ))
}

/// A dropped interrupt still owes a tool response per suspended call, or the
/// conversation would carry dangling tool_call_ids. The abandoned job rows
/// stay in `created` and fall to the orphan reaper.
fn abort_pending_interrupt(current: &mut Vec<ChatMessage>, interrupt: &Interrupt) {
    let aborted = "<tool-error> Aborted: a critical error stopped this run \
                   before the worker could start.";
    match interrupt {
        Interrupt::WorkersPending { created } => {
            for spawned in created {
                current.push(ChatMessage::tool_result(
                    &spawned.tool_call_id,
                    "spawn_worker",
                    aborted,
                ));
            }
        }
        Interrupt::WaitForWorker { tool_call_id, .. } => {
            current.push(ChatMessage::tool_result(
                tool_call_id,
                "wait_for_worker",
                aborted,
            ));
        }
    }
}

/// Tool calls on the trailing assistant message that have no tool-response
/// message yet.
fn pending_tool_calls(messages: &[ChatMessage]) -> Vec<ToolCall> {
    let Some(last_assistant) = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant || m.role == Role::User)
    else {
        return Vec::new();
    };
    if last_assistant.role != Role::Assistant || last_assistant.tool_calls().is_empty() {
        return Vec::new();
    }
    let responded: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    last_assistant
        .tool_calls()
        .iter()
        .filter(|tc| !responded.contains(tc.id.as_str()))
        .cloned()
        .collect()
}

/// Tool names returned by `search_tools` calls in this batch, de-duplicated
/// and capped.
fn collect_search_results(messages: &[ChatMessage]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for msg in messages {
        if msg.name.as_deref() != Some("search_tools") {
            continue;
        }
        let Ok(payload) = serde_json::from_str::<serde_json::Value>(&msg.content) else {
            tracing::debug!("search_tools result not JSON; skipping rebind");
            continue;
        };
        for entry in payload["tools"].as_array().into_iter().flatten() {
            if let Some(name) = entry["name"].as_str() {
                if seen.insert(name.to_string()) {
                    names.push(name.to_string());
                }
            }
        }
    }
    names.truncate(MAX_TOOLS_FROM_SEARCH);
    names
}
