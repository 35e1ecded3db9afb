//! Lifecycle event publishing.
//!
//! Every event is appended to the store's per-run log (durable, replayable
//! by monotonic id) and fanned out to in-process subscribers over a
//! broadcast channel. The transport layer subscribes here; the core never
//! talks to sockets.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::context::RunContext;
use crate::error::StoreError;
use crate::model::{EventType, RunEvent};
use crate::store::Store;

const BROADCAST_CAPACITY: usize = 1024;

/// Durable event log plus in-process fan-out.
pub struct EventBus {
    store: Arc<dyn Store>,
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { store, tx }
    }

    /// Subscribe to live events. Reconnecting clients replay the durable log
    /// via `Store::events_after` first, then switch to this feed.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Stream adapter over `subscribe` for transport layers that consume
    /// `futures::Stream` (SSE bridges and the like).
    pub fn subscribe_stream(
        &self,
    ) -> tokio_stream::wrappers::BroadcastStream<RunEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.tx.subscribe())
    }

    /// Append an event durably and fan it out.
    pub async fn emit(
        &self,
        run_id: Uuid,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<RunEvent, StoreError> {
        let event = self
            .store
            .append_event(run_id, event_type.as_str(), payload)
            .await?;
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event.clone());
        Ok(event)
    }
}

/// Emitter bound to one run's identity. Merges `owner_id` and `trace_id`
/// into every payload so subscribers can filter without joins.
#[derive(Clone)]
pub struct RunEmitter {
    bus: Arc<EventBus>,
    run_id: Uuid,
    owner_id: String,
    trace_id: Uuid,
    message_id: Uuid,
}

impl RunEmitter {
    pub fn new(bus: Arc<EventBus>, ctx: &RunContext) -> Self {
        Self {
            bus,
            run_id: ctx.run_id,
            owner_id: ctx.owner_id.clone(),
            trace_id: ctx.trace_id,
            message_id: ctx.message_id,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Emit with identity fields merged in. Event failures are logged and
    /// swallowed: losing an event must never fail the run.
    pub async fn emit(&self, event_type: EventType, payload: serde_json::Value) {
        let mut payload = payload;
        if let Some(map) = payload.as_object_mut() {
            map.insert("owner_id".to_string(), json!(self.owner_id));
            map.insert("trace_id".to_string(), json!(self.trace_id));
            map.insert("message_id".to_string(), json!(self.message_id));
        }
        if let Err(e) = self.bus.emit(self.run_id, event_type, payload).await {
            tracing::warn!(
                run_id = %self.run_id,
                event_type = %event_type,
                "Failed to persist event: {}",
                e
            );
        }
    }

    pub async fn emit_tool_started(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        args_preview: &str,
    ) {
        self.emit(
            EventType::WorkerToolStarted,
            json!({
                "tool_name": tool_name,
                "tool_call_id": tool_call_id,
                "args_preview": args_preview,
            }),
        )
        .await;
    }

    pub async fn emit_tool_completed(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        duration_ms: i64,
        result_preview: &str,
    ) {
        self.emit(
            EventType::WorkerToolCompleted,
            json!({
                "tool_name": tool_name,
                "tool_call_id": tool_call_id,
                "duration_ms": duration_ms,
                "result_preview": result_preview,
            }),
        )
        .await;
    }

    pub async fn emit_tool_failed(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        duration_ms: i64,
        error: &str,
    ) {
        self.emit(
            EventType::WorkerToolFailed,
            json!({
                "tool_name": tool_name,
                "tool_call_id": tool_call_id,
                "duration_ms": duration_ms,
                "error": error,
            }),
        )
        .await;
    }

    /// `stream_control` event governing the client-facing stream lease.
    pub async fn emit_stream_control(
        &self,
        action: &str,
        reason: &str,
        ttl_ms: Option<u64>,
        pending_workers: Option<i64>,
    ) {
        let mut payload = json!({
            "action": action,
            "reason": reason,
            "run_id": self.run_id,
        });
        if let Some(map) = payload.as_object_mut() {
            if let Some(ttl) = ttl_ms {
                // Cap the lease at 5 minutes.
                map.insert("ttl_ms".to_string(), json!(ttl.min(300_000)));
            }
            if let Some(pending) = pending_workers {
                map.insert("pending_workers".to_string(), json!(pending));
            }
        }
        self.emit(EventType::StreamControl, payload).await;
    }
}

/// Clip a preview string to a bounded length for event payloads.
pub fn safe_preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let clipped: String = s.chars().take(max_chars).collect();
        format!("{}…", clipped)
    }
}
