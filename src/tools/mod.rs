//! Tools the agents can call.

pub mod builtin;
mod registry;
mod tool;

pub use registry::{LazyToolBinder, ToolRegistry, CORE_TOOLS};
pub use tool::{require_str, Suspension, Tool, ToolContext, ToolError, ToolOutput};
