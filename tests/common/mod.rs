//! Shared test harness: in-memory store + scripted LLM + wired runtime.

use std::sync::Arc;
use std::time::Duration;

use brigade::config::{
    Config, DatabaseConfig, EngineSettings, LlmConfig, SupervisorSettings, WorkerSettings,
};
use brigade::llm::{ScriptedProvider, ToolCompletionResponse};
use brigade::model::RunEvent;
use brigade::store::{MemoryStore, Store};
use brigade::Runtime;
use tempfile::TempDir;

pub struct Harness {
    pub runtime: Runtime,
    pub provider: Arc<ScriptedProvider>,
    pub store: Arc<MemoryStore>,
    artifacts_dir: TempDir,
}

impl Harness {
    /// Base directory the runtime's artifact stores write under.
    #[allow(dead_code)]
    pub fn artifacts_path(&self) -> &std::path::Path {
        self.artifacts_dir.path()
    }
}

pub fn test_config(artifacts_dir: &TempDir) -> Config {
    Config {
        database: DatabaseConfig {
            url: String::new(),
            pool_size: 1,
        },
        llm: LlmConfig {
            base_url: String::new(),
            api_key: None,
            default_model: "gpt-5".to_string(),
            worker_model: "gpt-5-mini".to_string(),
        },
        engine: EngineSettings::default(),
        supervisor: SupervisorSettings {
            run_timeout: Duration::from_secs(30),
            barrier_deadline: Duration::from_secs(600),
            inbox_stale_after: Duration::from_secs(5),
            continuation_depth_limit: 10,
        },
        worker: WorkerSettings {
            poll_interval: Duration::from_millis(10),
            reaper_interval: Duration::from_millis(50),
            orphan_cutoff: Duration::from_secs(300),
            concurrency: 1,
        },
        artifacts_dir: artifacts_dir.path().to_path_buf(),
    }
}

/// Build a runtime over the given LLM script. Background loops are NOT
/// started; tests drive the processor explicitly for determinism.
pub fn harness(script: Vec<ToolCompletionResponse>) -> Harness {
    harness_with(script, |c| c)
}

pub fn harness_with(
    script: Vec<ToolCompletionResponse>,
    tweak: impl FnOnce(Config) -> Config,
) -> Harness {
    let artifacts_dir = tempfile::tempdir().expect("tempdir");
    let config = tweak(test_config(&artifacts_dir));
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(ScriptedProvider::new(script));
    let runtime = Runtime::build(&config, store.clone(), provider.clone());
    Harness {
        runtime,
        provider,
        store,
        artifacts_dir,
    }
}

/// Drain the queue: claim and run worker jobs until none are left.
pub async fn drain_worker_queue(harness: &Harness) -> usize {
    let mut ran = 0;
    while let Some(job) = harness
        .runtime
        .store
        .claim_next_queued_job()
        .await
        .expect("claim")
    {
        harness.runtime.processor.run_job(job).await;
        ran += 1;
    }
    ran
}

pub fn count_events(events: &[RunEvent], event_type: &str) -> usize {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}
