//! Barrier coordination: two-phase commit for spawned workers, atomic
//! completion, and deadline reaping.
//!
//! The store serializes the critical sections (install is one transaction;
//! completion runs under the barrier row lock). The coordinator adds the
//! orchestration and event emission around them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::engine::Interrupt;
use crate::error::StoreError;
use crate::events::EventBus;
use crate::model::{BarrierCompletion, BarrierJob, EventType, WorkerBarrier};
use crate::store::Store;

/// Statistics from one reaper cycle.
#[derive(Debug, Default)]
pub struct ReapStats {
    /// Expired barriers claimed this cycle, with their full batches. The
    /// caller owes each one a batch resume.
    pub claimed: Vec<(Uuid, Vec<BarrierJob>)>,
    /// Orphaned `created` jobs failed this cycle.
    pub orphans: Vec<Uuid>,
}

/// Coordinates worker barriers for supervisor runs.
pub struct BarrierCoordinator {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    deadline: Duration,
    orphan_cutoff: Duration,
}

impl BarrierCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        deadline: Duration,
        orphan_cutoff: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            deadline,
            orphan_cutoff,
        }
    }

    fn next_deadline(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.deadline).unwrap_or(chrono::Duration::minutes(10))
    }

    /// Install (or reset) the run's barrier for an interrupt and flip the
    /// new jobs to `queued` — one store transaction, after which workers may
    /// observe their jobs. Emits `worker_spawned` for each job afterwards.
    pub async fn install(
        &self,
        run_id: Uuid,
        interrupt: &Interrupt,
    ) -> Result<WorkerBarrier, StoreError> {
        let entries = interrupt.barrier_entries();
        tracing::info!(
            run_id = %run_id,
            count = entries.len(),
            "Installing barrier (two-phase commit)"
        );
        let barrier = self
            .store
            .install_barrier(run_id, &entries, self.next_deadline())
            .await?;

        if let Interrupt::WorkersPending { created } = interrupt {
            for spawned in created {
                let model = self
                    .store
                    .get_worker_job(spawned.job_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|j| j.model);
                if let Err(e) = self
                    .bus
                    .emit(
                        run_id,
                        EventType::WorkerSpawned,
                        json!({
                            "job_id": spawned.job_id,
                            "tool_call_id": spawned.tool_call_id,
                            "task": crate::events::safe_preview(&spawned.task, 100),
                            "model": model,
                        }),
                    )
                    .await
                {
                    tracing::warn!("Failed to emit worker_spawned: {}", e);
                }
            }
        }

        Ok(barrier)
    }

    /// Record one worker completion. Exactly one completion per batch comes
    /// back as `Resume`; the caller then drives the resume service.
    pub async fn report_completion(
        &self,
        run_id: Uuid,
        job_id: Uuid,
        result: &str,
        error: Option<&str>,
    ) -> Result<BarrierCompletion, StoreError> {
        let completion = self
            .store
            .complete_barrier_job(run_id, job_id, result, error)
            .await?;

        match &completion {
            BarrierCompletion::Resume { batch } => {
                tracing::info!(
                    run_id = %run_id,
                    batch = batch.len(),
                    "Barrier complete; claimed resume"
                );
            }
            BarrierCompletion::Waiting {
                completed,
                expected,
            } => {
                tracing::info!(
                    run_id = %run_id,
                    job_id = %job_id,
                    "Barrier progress: {}/{} complete",
                    completed,
                    expected
                );
            }
            BarrierCompletion::Skipped { reason } => {
                // Another party owns the barrier; back off quietly.
                tracing::debug!(run_id = %run_id, job_id = %job_id, "Completion skipped: {}", reason);
            }
        }

        Ok(completion)
    }

    /// One reaper cycle: claim expired barriers (timing out incomplete jobs)
    /// and fail orphaned `created` jobs. Lock contention on a barrier means
    /// another process is handling it — skip.
    pub async fn reap_cycle(&self) -> Result<ReapStats, StoreError> {
        let now = Utc::now();
        let mut stats = ReapStats::default();

        for barrier in self.store.expired_barriers(now).await? {
            match self.store.claim_expired_barrier(barrier.id, now).await {
                Ok(Some(batch)) => {
                    let timed_out = batch
                        .iter()
                        .filter(|bj| bj.status == crate::model::BarrierJobStatus::Timeout)
                        .count();
                    tracing::info!(
                        run_id = %barrier.run_id,
                        timed_out,
                        "Reaped expired barrier"
                    );
                    stats.claimed.push((barrier.run_id, batch));
                }
                Ok(None) => {
                    tracing::debug!(
                        barrier_id = %barrier.id,
                        "Skipping expired barrier - claimed elsewhere"
                    );
                }
                Err(e) => {
                    tracing::error!(barrier_id = %barrier.id, "Failed to reap barrier: {}", e);
                }
            }
        }

        let cutoff = now
            - chrono::Duration::from_std(self.orphan_cutoff).unwrap_or(chrono::Duration::minutes(5));
        let orphans = self.store.reap_orphaned_jobs(cutoff).await?;
        if !orphans.is_empty() {
            tracing::warn!("Cleaned up {} orphaned 'created' job(s)", orphans.len());
        }
        stats.orphans = orphans;

        Ok(stats)
    }
}
