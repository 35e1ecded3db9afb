//! End-to-end supervisor scenarios over the in-memory store and a scripted
//! model: direct tool use, single and parallel delegation, deferral, and
//! late-result continuations.

mod common;

use std::time::Duration;

use brigade::llm::{Role, ScriptedProvider};
use brigade::model::{RunStatus, WorkerJobStatus};
use brigade::store::Store;
use brigade::supervisor::SupervisorRequest;
use common::{count_events, drain_worker_queue, harness};
use pretty_assertions::assert_eq;
use serde_json::json;

fn spawn_call(id: &str, task: &str) -> brigade::llm::ToolCall {
    ScriptedProvider::tool_call(id, "spawn_worker", json!({"task": task}))
}

#[tokio::test]
async fn single_tool_no_delegation() {
    // S1: one tool round, no workers, terminal SUCCESS with closed stream.
    let h = harness(vec![
        ScriptedProvider::calls(vec![ScriptedProvider::tool_call(
            "call_time",
            "get_current_time",
            json!({}),
        )]),
        ScriptedProvider::text("It is 2025-01-01T12:00:00Z"),
    ]);

    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "What time is it?"))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.result.as_deref(), Some("It is 2025-01-01T12:00:00Z"));

    let events = h.store.events_after(result.run_id, 0).await.unwrap();
    for expected in [
        "supervisor_started",
        "worker_tool_started",
        "worker_tool_completed",
        "supervisor_complete",
        "run_updated",
        "stream_control",
    ] {
        assert!(
            events.iter().any(|e| e.event_type == expected),
            "missing event {}",
            expected
        );
    }
    let close = events
        .iter()
        .find(|e| e.event_type == "stream_control")
        .unwrap();
    assert_eq!(close.payload["action"], "close");

    // The tool round is recorded as a valid conversation.
    let thread = h
        .store
        .find_or_create_supervisor_thread("owner-1")
        .await
        .unwrap();
    let messages = h.store.thread_messages(thread.id).await.unwrap();
    let tool_msg = messages
        .iter()
        .find(|m| m.role == brigade::model::Role::Tool)
        .expect("tool response persisted");
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_time"));
}

#[tokio::test]
async fn single_worker_delegation_resumes_to_success() {
    // S2: spawn one worker; barrier fires the resume; supervisor finishes.
    let h = harness(vec![
        ScriptedProvider::calls(vec![spawn_call("call_spawn", "Check disk usage on prod-web")]),
        ScriptedProvider::text("Disk at 47%"), // worker's loop
        ScriptedProvider::text("Disk is at 47% on prod-web."), // resume synthesis
    ]);

    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new(
            "owner-1",
            "Check disk usage on prod-web",
        ))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Waiting);

    let run = h.store.get_run(result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Waiting);
    let barrier = h.store.get_barrier(result.run_id).await.unwrap().unwrap();
    assert_eq!(barrier.expected_count, 1);

    assert_eq!(drain_worker_queue(&h).await, 1);

    let run = h.store.get_run(result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let thread = h
        .store
        .find_or_create_supervisor_thread("owner-1")
        .await
        .unwrap();
    let messages = h.store.thread_messages(thread.id).await.unwrap();
    let spawn_response = messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("call_spawn"))
        .expect("spawn tool response injected on resume");
    assert!(spawn_response.content.contains("Disk at 47%"));

    let final_msg = messages.last().unwrap();
    assert_eq!(final_msg.role, brigade::model::Role::Assistant);
    assert_eq!(final_msg.content, "Disk is at 47% on prod-web.");

    let events = h.store.events_after(result.run_id, 0).await.unwrap();
    assert_eq!(count_events(&events, "supervisor_resumed"), 1);
    assert_eq!(count_events(&events, "worker_complete"), 1);
}

#[tokio::test]
async fn parallel_workers_resume_exactly_once() {
    // S3/S4: two workers in one turn; the second completion claims the one
    // and only resume.
    let h = harness(vec![
        ScriptedProvider::calls(vec![
            spawn_call("call_a", "Check disk usage on prod-web"),
            spawn_call("call_b", "Check disk usage on prod-db"),
        ]),
        ScriptedProvider::text("prod-web: 47%"),
        ScriptedProvider::text("prod-db: 81%"),
        ScriptedProvider::text("web 47%, db 81%"),
    ]);

    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new(
            "owner-1",
            "Check disk usage on prod-web AND prod-db in parallel",
        ))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Waiting);

    let barrier = h.store.get_barrier(result.run_id).await.unwrap().unwrap();
    assert_eq!(barrier.expected_count, 2);

    assert_eq!(drain_worker_queue(&h).await, 2);

    let run = h.store.get_run(result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let events = h.store.events_after(result.run_id, 0).await.unwrap();
    assert_eq!(count_events(&events, "supervisor_resumed"), 1);
    assert_eq!(count_events(&events, "worker_spawned"), 2);
    assert_eq!(count_events(&events, "worker_complete"), 2);

    // Both tool responses present, both matched to requests.
    let thread = h
        .store
        .find_or_create_supervisor_thread("owner-1")
        .await
        .unwrap();
    let messages = h.store.thread_messages(thread.id).await.unwrap();
    for call in ["call_a", "call_b"] {
        assert!(
            messages
                .iter()
                .any(|m| m.tool_call_id.as_deref() == Some(call)),
            "missing tool response for {}",
            call
        );
    }
}

#[tokio::test]
async fn long_worker_result_resumes_with_artifact_summary() {
    // The resume-injected tool message prefers the worker's sidecar summary;
    // the full result stays in the artifact store for read_worker_result.
    let long_result = "finding ".repeat(200); // ~1600 chars, over the summary threshold
    let h = harness(vec![
        ScriptedProvider::calls(vec![spawn_call("call_research", "big research task")]),
        ScriptedProvider::text(long_result.clone()),
        ScriptedProvider::text("summarized for the user"),
    ]);

    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "do big research"))
        .await
        .unwrap();
    assert_eq!(drain_worker_queue(&h).await, 1);

    let thread = h
        .store
        .find_or_create_supervisor_thread("owner-1")
        .await
        .unwrap();
    let messages = h.store.thread_messages(thread.id).await.unwrap();
    let tool_msg = messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("call_research"))
        .expect("resume-injected tool response");

    // Summary, not the raw 1600-char result.
    assert!(tool_msg.content.starts_with("finding"));
    assert!(
        tool_msg.content.chars().count() < 400,
        "expected the clipped summary, got {} chars",
        tool_msg.content.chars().count()
    );

    // The full result is still readable from the artifact store.
    let job = h
        .store
        .find_job_by_tool_call(result.run_id, "call_research")
        .await
        .unwrap()
        .unwrap();
    let artifacts = brigade::artifacts::ArtifactStore::new(h.artifacts_path());
    let stored = artifacts.get_result(job.worker_id.as_deref().unwrap()).await.unwrap();
    assert_eq!(stored, long_result);
}

#[tokio::test]
async fn mixed_turn_orders_tool_responses_around_interrupt() {
    // Property 4: non-spawn responses are persisted before the interrupt;
    // the spawn response arrives on resume; no orphan tool messages.
    let h = harness(vec![
        ScriptedProvider::calls(vec![
            ScriptedProvider::tool_call("call_t1", "get_current_time", json!({})),
            spawn_call("call_w", "long task"),
            ScriptedProvider::tool_call("call_t2", "get_current_time", json!({})),
        ]),
        ScriptedProvider::text("worker output"),
        ScriptedProvider::text("done"),
    ]);

    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "mixed turn"))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Waiting);

    let thread = h
        .store
        .find_or_create_supervisor_thread("owner-1")
        .await
        .unwrap();
    let before_resume = h.store.thread_messages(thread.id).await.unwrap();
    let ids_before: Vec<Option<&str>> = before_resume
        .iter()
        .filter(|m| m.role == brigade::model::Role::Tool)
        .map(|m| m.tool_call_id.as_deref())
        .collect();
    assert!(ids_before.contains(&Some("call_t1")));
    assert!(ids_before.contains(&Some("call_t2")));
    assert!(!ids_before.contains(&Some("call_w")));

    drain_worker_queue(&h).await;

    let after = h.store.thread_messages(thread.id).await.unwrap();
    let spawn_msg = after
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("call_w"))
        .expect("spawn response appended on resume");

    // Every tool message has a matching assistant tool-call request.
    let requested: Vec<String> = after
        .iter()
        .filter_map(|m| m.tool_calls.as_ref())
        .flatten()
        .map(|tc| tc.id.clone())
        .collect();
    for msg in after.iter().filter(|m| m.role == brigade::model::Role::Tool) {
        let id = msg.tool_call_id.as_deref().unwrap();
        assert!(requested.iter().any(|r| r == id), "orphan tool message {}", id);
    }
    // And the non-spawn responses precede the spawn response.
    let t1_pos = after
        .iter()
        .position(|m| m.tool_call_id.as_deref() == Some("call_t1"))
        .unwrap();
    let w_pos = after
        .iter()
        .position(|m| m.id == spawn_msg.id)
        .unwrap();
    assert!(t1_pos < w_pos);
}

#[tokio::test]
async fn idempotent_spawn_reuses_job_on_retry() {
    // Property 2: re-running the spawn path for the same toolCallId never
    // creates a second job.
    let h = harness(vec![
        ScriptedProvider::calls(vec![spawn_call("call_same", "task")]),
        // Retried turn (same pending tool call on resume detection).
        ScriptedProvider::text("worker output"),
        ScriptedProvider::text("done"),
    ]);

    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "spawn please"))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Waiting);

    let job = h
        .store
        .find_job_by_tool_call(result.run_id, "call_same")
        .await
        .unwrap()
        .expect("job created");

    // Simulate a crash-retry: drive the spawn tool again with the same ids.
    use brigade::tools::{Tool, ToolContext, ToolError};
    let ctx = ToolContext {
        run: brigade::context::RunContext {
            run_id: result.run_id,
            owner_id: "owner-1".to_string(),
            thread_id: result.thread_id,
            trace_id: uuid::Uuid::new_v4(),
            message_id: uuid::Uuid::new_v4(),
            model: "gpt-5".to_string(),
            reasoning_effort: None,
        },
        store: h.store.clone(),
        artifacts: std::sync::Arc::new(brigade::artifacts::ArtifactStore::new(
            std::env::temp_dir(),
        )),
        outputs: std::sync::Arc::new(brigade::artifacts::ToolOutputStore::new(
            std::env::temp_dir(),
        )),
        tool_call_id: "call_same".to_string(),
    };
    let tool = brigade::tools::builtin::SpawnWorkerTool;
    let retry = tool.execute(json!({"task": "task"}), &ctx).await;
    match retry {
        Err(ToolError::Suspend(brigade::tools::Suspension::WorkerSpawned { job_id, .. })) => {
            assert_eq!(job_id, job.id, "retry must reuse the existing job");
        }
        other => panic!("expected suspension, got {:?}", other.map(|_| ())),
    }

    // Still exactly one job for this run.
    let pending = h.store.pending_worker_count(result.run_id).await.unwrap();
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn deferred_run_returns_early_and_completes_in_background() {
    // S6 first half: a slow model call defers the request but the run
    // finishes normally in the background.
    let artifacts_dir = tempfile::tempdir().unwrap();
    let config = common::test_config(&artifacts_dir);
    let store = std::sync::Arc::new(brigade::store::MemoryStore::new());
    let provider = std::sync::Arc::new(
        ScriptedProvider::new(vec![ScriptedProvider::text("slow answer")])
            .with_delay(Duration::from_millis(300)),
    );
    let runtime = brigade::Runtime::build(&config, store.clone(), provider);

    let result = runtime
        .supervisor
        .run_supervisor({
            let mut req = SupervisorRequest::new("owner-1", "think slowly");
            req.timeout = Some(Duration::from_millis(50));
            req
        })
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Deferred);
    assert!(result.result.unwrap().contains("background"));

    let events = store.events_after(result.run_id, 0).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "supervisor_deferred"));

    // The shielded task finishes the run normally.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let run = store.get_run(result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn late_worker_completion_triggers_continuation_run() {
    // S6 second half: worker completes after the original run is terminal;
    // a continuation run chained via continuation_of_run_id synthesizes it.
    let h = harness(vec![
        ScriptedProvider::calls(vec![spawn_call("call_late", "slow job")]),
        ScriptedProvider::text("late result"), // worker
        ScriptedProvider::text("Here is what the worker found."), // continuation
    ]);

    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "kick off slow job"))
        .await
        .unwrap();

    // Force the original run terminal before the worker completes, as a
    // deferral would.
    h.store
        .set_run_status(result.run_id, RunStatus::Deferred)
        .await
        .unwrap();
    // Barrier must not fire a WAITING resume now.
    h.store
        .set_barrier_status(result.run_id, brigade::model::BarrierStatus::Failed)
        .await
        .unwrap();

    drain_worker_queue(&h).await;

    let continuation = h
        .store
        .find_continuation_run(result.run_id)
        .await
        .unwrap()
        .expect("continuation run created");
    assert_eq!(continuation.continuation_of_run_id, Some(result.run_id));
    assert_eq!(continuation.root_run_id, Some(result.run_id));
    assert_eq!(continuation.status, RunStatus::Success);

    // The continuation prompt is internal: stored for context, hidden from
    // user-visible history.
    let thread = h
        .store
        .find_or_create_supervisor_thread("owner-1")
        .await
        .unwrap();
    let messages = h.store.thread_messages(thread.id).await.unwrap();
    let prompt = messages
        .iter()
        .find(|m| m.content.contains("[Worker inbox]"))
        .expect("synthetic continuation prompt");
    assert!(prompt.internal);
}

#[tokio::test]
async fn empty_response_recovery_forces_tools_then_errors() {
    // One empty response gets a forced retry; two produce a concrete error.
    let h = harness(vec![
        ScriptedProvider::empty(),
        ScriptedProvider::text("recovered"),
    ]);
    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "hello"))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.result.as_deref(), Some("recovered"));

    let requests = h.provider.seen_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].tool_choice.as_deref(), Some("required"));
    assert!(requests[1]
        .messages
        .iter()
        .any(|m| m.role == Role::System && m.content.contains("previous response was empty")));

    // Double-empty case.
    let h = harness(vec![ScriptedProvider::empty(), ScriptedProvider::empty()]);
    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "hello"))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Success);
    assert!(result.result.unwrap().contains("empty response twice"));
}

#[tokio::test]
async fn iteration_bound_stops_runaway_loop() {
    // Property 5: the engine never runs more than 50 tool rounds.
    let mut script = Vec::new();
    for i in 0..60 {
        script.push(ScriptedProvider::calls(vec![ScriptedProvider::tool_call(
            &format!("call_{}", i),
            "get_current_time",
            json!({}),
        )]));
    }
    let h = harness(script);
    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "loop forever"))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Success);
    assert!(result.result.unwrap().contains("maximum of 50"));
    // 50 executed rounds consume 50 scripted responses; the 51st round is
    // cut off before its tools run.
    assert!(h.provider.remaining() >= 9);
}

#[tokio::test]
async fn inbox_surfaces_results_and_acknowledges_after_persist() {
    // Property 9: a completed worker shows up in the next turn's inbox and
    // is acknowledged only once the context message is durably stored.
    let h = harness(vec![
        ScriptedProvider::calls(vec![spawn_call("call_1", "background task")]),
        ScriptedProvider::text("background done"),
        ScriptedProvider::text("synthesized"),
        ScriptedProvider::text("second turn answer"),
    ]);

    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "do background work"))
        .await
        .unwrap();
    drain_worker_queue(&h).await;
    let run = h.store.get_run(result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let job = h
        .store
        .find_job_by_tool_call(result.run_id, "call_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, WorkerJobStatus::Success);
    assert!(!job.acknowledged, "not acknowledged until the inbox shows it");

    // Next user turn injects the inbox and acknowledges.
    h.runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "anything new?"))
        .await
        .unwrap();

    let job = h.store.get_worker_job(job.id).await.unwrap().unwrap();
    assert!(job.acknowledged);

    let thread = h
        .store
        .find_or_create_supervisor_thread("owner-1")
        .await
        .unwrap();
    let messages = h.store.thread_messages(thread.id).await.unwrap();
    assert!(messages
        .iter()
        .any(|m| m.content.contains(brigade::supervisor::RECENT_WORKER_CONTEXT_MARKER)));
}
