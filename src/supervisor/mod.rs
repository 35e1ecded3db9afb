//! Supervisor lifecycle service and inbox context.

pub mod inbox;
pub mod prompt;
mod service;

pub use inbox::{build_inbox_context, cleanup_stale_inbox, InboxContext, RECENT_WORKER_CONTEXT_MARKER};
pub use service::{SupervisorRequest, SupervisorRunResult, SupervisorService};
