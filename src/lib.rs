//! Hierarchical agent execution core.
//!
//! A long-lived supervisor agent reasons about user tasks and delegates real
//! work to disposable background workers. Three subsystems carry the load:
//!
//! - the **ReAct engine** (`engine`): model ↔ tool loop with bounded
//!   iterations, parallel dispatch and a typed interrupt;
//! - the **barrier coordinator** (`barrier`): a two-phase-commit barrier
//!   synchronizing N parallel workers onto exactly one supervisor resume;
//! - the **resume service** (`resume`): injects worker results as tool
//!   responses and re-enters the engine, or chains continuation runs when
//!   results arrive late.
//!
//! Transport, auth and tool implementations live behind interfaces; this
//! crate owns the execution semantics.

pub mod artifacts;
pub mod barrier;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod llm;
pub mod model;
pub mod resume;
pub mod store;
pub mod supervisor;
pub mod tools;
pub mod worker;

use std::sync::Arc;

use crate::barrier::BarrierCoordinator;
use crate::config::Config;
use crate::engine::EngineDeps;
use crate::events::EventBus;
use crate::llm::LlmProvider;
use crate::resume::ResumeService;
use crate::store::Store;
use crate::supervisor::SupervisorService;
use crate::worker::WorkerProcessor;

/// Fully wired runtime: services plus the background loop handles.
pub struct Runtime {
    pub store: Arc<dyn Store>,
    pub bus: Arc<EventBus>,
    pub supervisor: Arc<SupervisorService>,
    pub resume: Arc<ResumeService>,
    pub processor: Arc<WorkerProcessor>,
    pub coordinator: Arc<BarrierCoordinator>,
}

impl Runtime {
    /// Wire every service against the given store and LLM provider.
    pub fn build(config: &Config, store: Arc<dyn Store>, llm: Arc<dyn LlmProvider>) -> Self {
        let bus = Arc::new(EventBus::new(store.clone()));
        let artifacts = Arc::new(artifacts::ArtifactStore::new(&config.artifacts_dir));
        let outputs = Arc::new(artifacts::ToolOutputStore::new(&config.artifacts_dir));
        let deps = EngineDeps {
            llm,
            store: store.clone(),
            artifacts: artifacts.clone(),
            outputs,
        };

        let coordinator = Arc::new(BarrierCoordinator::new(
            store.clone(),
            bus.clone(),
            config.supervisor.barrier_deadline,
            config.worker.orphan_cutoff,
        ));

        let supervisor = Arc::new(SupervisorService::new(
            store.clone(),
            bus.clone(),
            deps.clone(),
            tools::builtin::supervisor_registry(),
            coordinator.clone(),
            config.engine.clone(),
            config.supervisor.clone(),
            config.llm.default_model.clone(),
        ));

        let resume = Arc::new(ResumeService::new(
            store.clone(),
            bus.clone(),
            deps.clone(),
            tools::builtin::supervisor_registry(),
            coordinator.clone(),
            supervisor.clone(),
            config.engine.clone(),
            config.supervisor.clone(),
        ));

        let processor = Arc::new(WorkerProcessor::new(
            store.clone(),
            bus.clone(),
            deps,
            tools::builtin::worker_registry(),
            resume.clone(),
            config.engine.clone(),
            config.worker.poll_interval,
        ));

        Self {
            store,
            bus,
            supervisor,
            resume,
            processor,
            coordinator,
        }
    }

    /// Start the worker pool and the barrier reaper.
    pub fn start_background(&self, config: &Config) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = self.processor.spawn(config.worker.concurrency);
        handles.push(resume::spawn_reaper(
            self.coordinator.clone(),
            self.resume.clone(),
            config.worker.reaper_interval,
        ));
        handles
    }
}
