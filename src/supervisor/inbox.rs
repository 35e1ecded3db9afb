//! Inbox context: a synthetic system message showing the supervisor its
//! background work without blocking on it.
//!
//! The message starts with a literal marker so earlier instances can be
//! identified and pruned before a new one is injected. Acknowledgement is
//! two-step: the builder returns the job ids, and the caller marks them only
//! AFTER the message is durably persisted — an inbox item is never "read"
//! unless the supervisor actually sees it.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::error::StoreError;
use crate::model::{WorkerJob, WorkerJobStatus};
use crate::store::Store;

/// Marker identifying ephemeral inbox context messages.
pub const RECENT_WORKER_CONTEXT_MARKER: &str = "<!-- RECENT_WORKER_CONTEXT -->";

const ACTIVE_LIMIT: usize = 5;
const UNREAD_LIMIT: usize = 5;
const ACKNOWLEDGED_LIMIT: usize = 3;
const ACKNOWLEDGED_WINDOW_MINUTES: i64 = 10;
const SUMMARY_MAX_CHARS: usize = 150;

/// A built inbox context, plus the jobs to acknowledge after persisting it.
#[derive(Debug)]
pub struct InboxContext {
    pub content: String,
    pub acknowledge: Vec<Uuid>,
}

fn elapsed_str(since: DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(since);
    let secs = elapsed.num_seconds().max(0);
    if secs >= 3600 {
        format!("{}h ago", secs / 3600)
    } else if secs >= 60 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}s ago", secs)
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(max_chars).collect();
        format!("{}...", clipped)
    }
}

async fn job_summary(artifacts: &ArtifactStore, job: &WorkerJob) -> String {
    if let Some(worker_id) = job.worker_id.as_deref() {
        if let Ok(metadata) = artifacts.get_metadata(worker_id).await {
            if let Some(summary) = metadata.summary {
                if !summary.trim().is_empty() {
                    return clip(&summary, SUMMARY_MAX_CHARS);
                }
            }
        }
    }
    clip(&job.task, SUMMARY_MAX_CHARS)
}

/// Build the inbox context for an owner. Returns `None` when there is
/// nothing to show.
pub async fn build_inbox_context(
    store: &dyn Store,
    artifacts: &ArtifactStore,
    owner_id: &str,
) -> Result<Option<InboxContext>, StoreError> {
    let active = store.active_worker_jobs(owner_id, ACTIVE_LIMIT).await?;
    let unread = store
        .unacknowledged_worker_jobs(owner_id, UNREAD_LIMIT)
        .await?;
    let cutoff = Utc::now() - chrono::Duration::minutes(ACKNOWLEDGED_WINDOW_MINUTES);
    let recent_acknowledged = store
        .recent_acknowledged_worker_jobs(owner_id, cutoff, ACKNOWLEDGED_LIMIT)
        .await?;

    if active.is_empty() && unread.is_empty() && recent_acknowledged.is_empty() {
        return Ok(None);
    }

    let mut lines = vec![
        RECENT_WORKER_CONTEXT_MARKER.to_string(),
        "## Worker Inbox".to_string(),
    ];

    if !active.is_empty() {
        lines.push("\n**Active Workers:**".to_string());
        for job in &active {
            let since = job.started_at.unwrap_or(job.created_at);
            lines.push(format!(
                "- Job {} [{}] ({})",
                job.id,
                job.status.as_str().to_uppercase(),
                elapsed_str(since)
            ));
            lines.push(format!("  Task: {}", clip(&job.task, 80)));
        }
    }

    let mut acknowledge = Vec::new();
    if !unread.is_empty() {
        lines.push("\n**New Results (unread):**".to_string());
        for job in &unread {
            let since = job.finished_at.unwrap_or(job.created_at);
            let icon = if job.status == WorkerJobStatus::Success {
                "OK"
            } else {
                "FAILED"
            };
            lines.push(format!(
                "- Job {} [{}] ({})",
                job.id,
                icon,
                elapsed_str(since)
            ));
            lines.push(format!("  {}", job_summary(artifacts, job).await));
            acknowledge.push(job.id);
        }
    }

    // Brief reference only, and only when there is nothing unread.
    if !recent_acknowledged.is_empty() && unread.is_empty() {
        lines.push("\n**Recent Work:**".to_string());
        for job in &recent_acknowledged {
            let since = job.finished_at.unwrap_or(job.created_at);
            lines.push(format!(
                "- Job {} [{}] {} ({})",
                job.id,
                job.status.as_str(),
                clip(&job.task, 60),
                elapsed_str(since)
            ));
        }
    }

    lines.push(String::new());
    if !acknowledge.is_empty() {
        lines.push("Use `read_worker_result(job_id)` for full details.".to_string());
    }
    if !active.is_empty() {
        lines.push("Use `check_worker_status()` to see worker progress.".to_string());
        lines.push("Use `wait_for_worker(job_id)` only if you must block for a result.".to_string());
    }

    Ok(Some(InboxContext {
        content: lines.join("\n"),
        acknowledge,
    }))
}

/// Prune earlier inbox messages from the thread.
///
/// The newest marked message survives only while younger than `min_age` (it
/// belongs to a concurrent in-flight request); everything else goes. Returns
/// (deleted count, surviving message content) — the caller skips injection
/// when the survivor already carries identical content.
pub async fn cleanup_stale_inbox(
    store: &dyn Store,
    thread_id: Uuid,
    min_age: std::time::Duration,
) -> Result<(u64, Option<String>), StoreError> {
    let marked = store
        .messages_with_marker(thread_id, RECENT_WORKER_CONTEXT_MARKER)
        .await?;
    if marked.is_empty() {
        return Ok((0, None));
    }

    let age_cutoff =
        Utc::now() - chrono::Duration::from_std(min_age).unwrap_or(chrono::Duration::seconds(5));

    // `marked` is newest-first.
    let newest = &marked[0];
    let (to_delete, survivor) = if newest.created_at >= age_cutoff {
        (&marked[1..], Some(newest.content.clone()))
    } else {
        (&marked[..], None)
    };

    let ids: Vec<i64> = to_delete.iter().map(|m| m.id).collect();
    let deleted = if ids.is_empty() {
        0
    } else {
        store.delete_messages(&ids).await?
    };
    if deleted > 0 {
        tracing::debug!(
            thread_id = %thread_id,
            "Cleaned up {} stale inbox context message(s)",
            deleted
        );
    }
    Ok((deleted, survivor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewMessage, NewWorkerJob};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn seed_job(store: &MemoryStore, owner: &str, task: &str) -> WorkerJob {
        store
            .create_worker_job(NewWorkerJob {
                owner_id: owner.to_string(),
                supervisor_run_id: Uuid::new_v4(),
                tool_call_id: Uuid::new_v4().to_string(),
                task: task.to_string(),
                model: "gpt-5-mini".to_string(),
                reasoning_effort: None,
                trace_id: None,
                config: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_inbox_is_none() {
        let store = MemoryStore::new();
        let dir = tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path());
        let inbox = build_inbox_context(&store, &artifacts, "owner-1")
            .await
            .unwrap();
        assert!(inbox.is_none());
    }

    #[tokio::test]
    async fn test_inbox_lists_unread_and_collects_acknowledgements() {
        let store = MemoryStore::new();
        let dir = tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path());

        let job = seed_job(&store, "owner-1", "check the disks").await;
        store
            .finish_worker_job(job.id, WorkerJobStatus::Success, Some("w-1"), None)
            .await
            .unwrap();
        artifacts.put_result("w-1", "Disk at 47%").await.unwrap();
        artifacts
            .put_metadata(
                "w-1",
                &crate::artifacts::WorkerMetadata {
                    summary: Some("Disk at 47%".to_string()),
                    duration_ms: 900,
                    usage: None,
                },
            )
            .await
            .unwrap();

        let inbox = build_inbox_context(&store, &artifacts, "owner-1")
            .await
            .unwrap()
            .expect("inbox present");
        assert!(inbox.content.starts_with(RECENT_WORKER_CONTEXT_MARKER));
        assert!(inbox.content.contains("New Results"));
        assert!(inbox.content.contains("Disk at 47%"));
        assert_eq!(inbox.acknowledge, vec![job.id]);

        // Builder must not acknowledge on its own.
        let unread = store
            .unacknowledged_worker_jobs("owner-1", 5)
            .await
            .unwrap();
        assert_eq!(unread.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_only_fresh_newest() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let thread = store.find_or_create_supervisor_thread("o").await.unwrap();

        for i in 0..3 {
            store
                .append_message(NewMessage::system(
                    thread.id,
                    format!("{}\ninbox v{}", RECENT_WORKER_CONTEXT_MARKER, i),
                ))
                .await
                .unwrap();
        }

        // All three are fresh; only the newest survives.
        let (deleted, survivor) =
            cleanup_stale_inbox(store.as_ref(), thread.id, std::time::Duration::from_secs(5))
                .await
                .unwrap();
        assert_eq!(deleted, 2);
        assert!(survivor.unwrap().contains("inbox v2"));

        // With a zero freshness window the survivor goes too.
        let (deleted, survivor) =
            cleanup_stale_inbox(store.as_ref(), thread.id, std::time::Duration::ZERO)
                .await
                .unwrap();
        assert_eq!(deleted, 1);
        assert!(survivor.is_none());
    }
}
