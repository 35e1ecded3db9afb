//! Append-only lifecycle events, one log per run, for durable replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A durably stored lifecycle event. Ordering within a run is by the
/// monotonic `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: i64,
    pub run_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Well-known event types published by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    SupervisorStarted,
    SupervisorThinking,
    SupervisorToken,
    SupervisorHeartbeat,
    SupervisorComplete,
    SupervisorWaiting,
    SupervisorDeferred,
    SupervisorResumed,
    WorkerSpawned,
    WorkerToolStarted,
    WorkerToolCompleted,
    WorkerToolFailed,
    WorkerComplete,
    RunUpdated,
    StreamControl,
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::SupervisorStarted => "supervisor_started",
            EventType::SupervisorThinking => "supervisor_thinking",
            EventType::SupervisorToken => "supervisor_token",
            EventType::SupervisorHeartbeat => "supervisor_heartbeat",
            EventType::SupervisorComplete => "supervisor_complete",
            EventType::SupervisorWaiting => "supervisor_waiting",
            EventType::SupervisorDeferred => "supervisor_deferred",
            EventType::SupervisorResumed => "supervisor_resumed",
            EventType::WorkerSpawned => "worker_spawned",
            EventType::WorkerToolStarted => "worker_tool_started",
            EventType::WorkerToolCompleted => "worker_tool_completed",
            EventType::WorkerToolFailed => "worker_tool_failed",
            EventType::WorkerComplete => "worker_complete",
            EventType::RunUpdated => "run_updated",
            EventType::StreamControl => "stream_control",
            EventType::Error => "error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
