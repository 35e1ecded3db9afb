//! Barrier properties over the full stack: exactly-once resume under
//! concurrency, fast-worker safety, deadline reaping, and barrier reuse on
//! re-interruption.

mod common;

use std::time::Duration;

use brigade::llm::ScriptedProvider;
use brigade::model::{
    BarrierCompletion, BarrierJobStatus, BarrierStatus, NewWorkerJob, RunStatus,
};
use brigade::store::Store;
use brigade::supervisor::SupervisorRequest;
use common::{count_events, drain_worker_queue, harness, harness_with};
use serde_json::json;

fn spawn_call(id: &str, task: &str) -> brigade::llm::ToolCall {
    ScriptedProvider::tool_call(id, "spawn_worker", json!({"task": task}))
}

#[tokio::test]
async fn concurrent_worker_completions_resume_exactly_once() {
    // Property 1 / S4: N workers complete concurrently; exactly one
    // completion claims the resume and exactly one supervisor_resumed event
    // is emitted.
    const N: usize = 6;

    let mut script = vec![ScriptedProvider::calls(
        (0..N)
            .map(|i| spawn_call(&format!("call_{}", i), &format!("task {}", i)))
            .collect(),
    )];
    for i in 0..N {
        script.push(ScriptedProvider::text(format!("worker {} done", i)));
    }
    script.push(ScriptedProvider::text("all workers done"));

    let h = harness(script);
    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "fan out"))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Waiting);

    // Claim all jobs first, then run them concurrently.
    let mut jobs = Vec::new();
    while let Some(job) = h.store.claim_next_queued_job().await.unwrap() {
        jobs.push(job);
    }
    assert_eq!(jobs.len(), N);

    let processor = h.runtime.processor.clone();
    let handles: Vec<_> = jobs
        .into_iter()
        .map(|job| {
            let processor = processor.clone();
            tokio::spawn(async move { processor.run_job(job).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let run = h.store.get_run(result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let events = h.store.events_after(result.run_id, 0).await.unwrap();
    assert_eq!(count_events(&events, "supervisor_resumed"), 1);
    assert_eq!(count_events(&events, "worker_complete"), N);

    let barrier = h.store.get_barrier(result.run_id).await.unwrap().unwrap();
    assert_eq!(barrier.status, BarrierStatus::Completed);
    assert_eq!(barrier.completed_count, N as i32);
}

#[tokio::test]
async fn fast_worker_cannot_complete_before_barrier_exists() {
    // Property 3: a completion reported before the barrier install commits
    // is skipped, and no resume fires until the install makes the job
    // observable.
    let h = harness(vec![]);

    let thread = h
        .store
        .find_or_create_supervisor_thread("owner-1")
        .await
        .unwrap();
    let run = h
        .store
        .create_run(brigade::model::NewRun {
            owner_id: "owner-1".to_string(),
            thread_id: thread.id,
            status: RunStatus::Running,
            trigger: brigade::model::RunTrigger::Api,
            assistant_message_id: uuid::Uuid::new_v4(),
            continuation_of_run_id: None,
            root_run_id: None,
            trace_id: uuid::Uuid::new_v4(),
            model: "gpt-5".to_string(),
            reasoning_effort: None,
            started_at: Some(chrono::Utc::now()),
        })
        .await
        .unwrap();

    // Phase 1 only: the job exists with status=created, no barrier yet.
    let job = h
        .store
        .create_worker_job(NewWorkerJob {
            owner_id: "owner-1".to_string(),
            supervisor_run_id: run.id,
            tool_call_id: "call_fast".to_string(),
            task: "fast".to_string(),
            model: "gpt-5-mini".to_string(),
            reasoning_effort: None,
            trace_id: None,
            config: None,
        })
        .await
        .unwrap();

    // The queue must not expose the job before the install commits.
    assert!(h.store.claim_next_queued_job().await.unwrap().is_none());

    // A premature completion is skipped without a resume.
    let completion = h
        .runtime
        .coordinator
        .report_completion(run.id, job.id, "too fast", None)
        .await
        .unwrap();
    assert!(matches!(completion, BarrierCompletion::Skipped { .. }));

    // Phase 2: install commits; the job becomes observable and completion
    // catches up normally.
    h.runtime
        .coordinator
        .install(
            run.id,
            &brigade::engine::Interrupt::WorkersPending {
                created: vec![brigade::engine::SpawnedJob {
                    job_id: job.id,
                    tool_call_id: "call_fast".to_string(),
                    task: "fast".to_string(),
                }],
            },
        )
        .await
        .unwrap();

    let claimed = h.store.claim_next_queued_job().await.unwrap();
    assert_eq!(claimed.unwrap().id, job.id);

    let completion = h
        .runtime
        .coordinator
        .report_completion(run.id, job.id, "done", None)
        .await
        .unwrap();
    assert!(matches!(completion, BarrierCompletion::Resume { .. }));
}

#[tokio::test]
async fn expired_barrier_is_reaped_with_timeout_results() {
    // Property 7 / S5: a barrier past its deadline resumes within one reaper
    // cycle; incomplete barrier-jobs become timeouts with a non-null error
    // and the supervisor sees the error text.
    let h = harness_with(
        vec![
            ScriptedProvider::calls(vec![spawn_call("call_hang", "hang forever")]),
            ScriptedProvider::text("The worker timed out before finishing."),
        ],
        |mut config| {
            config.supervisor.barrier_deadline = Duration::ZERO;
            config
        },
    );

    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "spawn a hanging worker"))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Waiting);

    // The worker never runs; the reaper claims the expired barrier and
    // issues a batch resume with the partial (timeout) results.
    let stats = h.runtime.coordinator.reap_cycle().await.unwrap();
    assert_eq!(stats.claimed.len(), 1);
    let (run_id, batch) = stats.claimed.into_iter().next().unwrap();
    assert_eq!(run_id, result.run_id);
    assert_eq!(batch[0].status, BarrierJobStatus::Timeout);
    assert!(batch[0].error.as_deref().unwrap().contains("timed out"));

    h.runtime.resume.resume_batch(run_id, batch).await;

    let run = h.store.get_run(result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let thread = h
        .store
        .find_or_create_supervisor_thread("owner-1")
        .await
        .unwrap();
    let messages = h.store.thread_messages(thread.id).await.unwrap();
    let tool_msg = messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("call_hang"))
        .expect("timeout tool response injected");
    assert!(tool_msg.content.contains("timed out"));
}

#[tokio::test]
async fn reinterruption_resets_and_reuses_the_barrier() {
    // §4.4 barrier reuse: a resume that interrupts again installs a fresh
    // batch on the same barrier row, with stale barrier-jobs pruned.
    let h = harness(vec![
        ScriptedProvider::calls(vec![spawn_call("call_one", "first wave")]),
        ScriptedProvider::text("first result"), // worker 1
        // Resume synthesizes and spawns a second wave.
        ScriptedProvider::calls(vec![spawn_call("call_two", "second wave")]),
        ScriptedProvider::text("second result"), // worker 2
        ScriptedProvider::text("both waves done"), // final resume
    ]);

    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "multi-wave work"))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Waiting);
    let first_barrier = h.store.get_barrier(result.run_id).await.unwrap().unwrap();

    // Wave 1 completes; the resume re-interrupts with wave 2. Run exactly
    // one job so the intermediate barrier state is observable.
    let wave1 = h.store.claim_next_queued_job().await.unwrap().unwrap();
    h.runtime.processor.run_job(wave1).await;
    let run = h.store.get_run(result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Waiting);

    let barrier = h.store.get_barrier(result.run_id).await.unwrap().unwrap();
    assert_eq!(barrier.id, first_barrier.id, "barrier row is reused");
    assert_eq!(barrier.status, BarrierStatus::Waiting);
    assert_eq!(barrier.completed_count, 0);
    assert_eq!(barrier.expected_count, 1);

    // Wave 2 completes; the run finishes.
    assert_eq!(drain_worker_queue(&h).await, 1);
    let run = h.store.get_run(result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let events = h.store.events_after(result.run_id, 0).await.unwrap();
    assert_eq!(count_events(&events, "supervisor_resumed"), 2);
    assert_eq!(count_events(&events, "worker_spawned"), 2);
}

#[tokio::test]
async fn failed_worker_surfaces_error_in_resume() {
    // A worker engine failure becomes a failed barrier-job whose error text
    // reaches the supervisor as a tool-error response.
    let h = harness(vec![
        ScriptedProvider::calls(vec![spawn_call("call_fail", "doomed task")]),
        // The worker never runs; the next scripted response feeds the resume.
        ScriptedProvider::text("acknowledged the failure"),
    ]);

    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "doomed"))
        .await
        .unwrap();

    // Complete the job as failed directly through the coordinator, the way
    // the processor reports a worker error.
    let job = h
        .store
        .find_job_by_tool_call(result.run_id, "call_fail")
        .await
        .unwrap()
        .unwrap();
    let completion = h
        .runtime
        .coordinator
        .report_completion(result.run_id, job.id, "", Some("ssh: connection refused"))
        .await
        .unwrap();
    let batch = match completion {
        BarrierCompletion::Resume { batch } => batch,
        other => panic!("expected resume, got {:?}", other),
    };
    assert_eq!(batch[0].status, BarrierJobStatus::Failed);

    h.runtime.resume.resume_batch(result.run_id, batch).await;

    let thread = h
        .store
        .find_or_create_supervisor_thread("owner-1")
        .await
        .unwrap();
    let messages = h.store.thread_messages(thread.id).await.unwrap();
    let tool_msg = messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("call_fail"))
        .unwrap();
    assert!(tool_msg.content.contains("<tool-error>"));
    assert!(tool_msg.content.contains("connection refused"));

    let run = h.store.get_run(result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn orphaned_created_jobs_are_reaped() {
    // A `created` job whose barrier install never committed is failed by the
    // reaper once past the cutoff.
    let h = harness_with(vec![], |mut config| {
        config.worker.orphan_cutoff = Duration::ZERO;
        config
    });

    let thread = h
        .store
        .find_or_create_supervisor_thread("owner-1")
        .await
        .unwrap();
    let run = h
        .store
        .create_run(brigade::model::NewRun {
            owner_id: "owner-1".to_string(),
            thread_id: thread.id,
            status: RunStatus::Running,
            trigger: brigade::model::RunTrigger::Api,
            assistant_message_id: uuid::Uuid::new_v4(),
            continuation_of_run_id: None,
            root_run_id: None,
            trace_id: uuid::Uuid::new_v4(),
            model: "gpt-5".to_string(),
            reasoning_effort: None,
            started_at: Some(chrono::Utc::now()),
        })
        .await
        .unwrap();
    let job = h
        .store
        .create_worker_job(NewWorkerJob {
            owner_id: "owner-1".to_string(),
            supervisor_run_id: run.id,
            tool_call_id: "call_orphan".to_string(),
            task: "orphan".to_string(),
            model: "gpt-5-mini".to_string(),
            reasoning_effort: None,
            trace_id: None,
            config: None,
        })
        .await
        .unwrap();

    // Give the row age > 0 relative to the zero cutoff.
    tokio::time::sleep(Duration::from_millis(5)).await;

    let stats = h.runtime.coordinator.reap_cycle().await.unwrap();
    assert_eq!(stats.orphans, vec![job.id]);

    let job = h.store.get_worker_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, brigade::model::WorkerJobStatus::Failed);
    assert!(job.error.unwrap().contains("Orphaned"));
}

#[tokio::test]
async fn run_status_is_monotonic_through_the_lifecycle() {
    // Property 8: the observable status path for a delegating run is
    // RUNNING → WAITING → RUNNING → SUCCESS, and terminal states reject
    // further CAS transitions.
    let h = harness(vec![
        ScriptedProvider::calls(vec![spawn_call("call_m", "task")]),
        ScriptedProvider::text("worker done"),
        ScriptedProvider::text("final"),
    ]);

    let result = h
        .runtime
        .supervisor
        .run_supervisor(SupervisorRequest::new("owner-1", "go"))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Waiting);

    drain_worker_queue(&h).await;
    let run = h.store.get_run(result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);

    // Terminal: a stale WAITING→RUNNING CAS must lose.
    let won = h
        .store
        .cas_run_status(result.run_id, RunStatus::Waiting, RunStatus::Running)
        .await
        .unwrap();
    assert!(!won);
}
