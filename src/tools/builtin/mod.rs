//! Built-in tools.

mod output;
mod search;
mod time;
mod workers;

pub use output::GetToolOutputTool;
pub use search::{SearchToolsTool, MAX_TOOLS_FROM_SEARCH};
pub use time::GetCurrentTimeTool;
pub use workers::{
    CancelWorkerTool, CheckWorkerStatusTool, ReadWorkerResultTool, SpawnWorkerTool,
    WaitForWorkerTool,
};

use std::sync::Arc;

use crate::tools::registry::ToolRegistry;

/// Registry for the supervisor: full delegation surface plus discovery.
pub fn supervisor_registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(GetCurrentTimeTool));
    registry.register(Arc::new(SpawnWorkerTool));
    registry.register(Arc::new(WaitForWorkerTool));
    registry.register(Arc::new(CheckWorkerStatusTool));
    registry.register(Arc::new(ReadWorkerResultTool));
    registry.register(Arc::new(CancelWorkerTool));
    registry.register(Arc::new(GetToolOutputTool));
    let registry = Arc::new(registry);
    // search_tools needs the finished registry to search over; register it
    // against a clone carrying everything above.
    let mut with_search = (*registry).clone();
    with_search.register(Arc::new(SearchToolsTool::new(registry)));
    Arc::new(with_search)
}

/// Registry for workers: no recursive delegation by default.
pub fn worker_registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(GetCurrentTimeTool));
    registry.register(Arc::new(GetToolOutputTool));
    Arc::new(registry)
}
