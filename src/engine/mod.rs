//! The ReAct execution engine.

mod interrupt;
mod react;
mod trim;
mod usage;

pub use interrupt::{EngineOutcome, Interrupt, SpawnedJob};
pub use react::{Engine, EngineDeps, MAX_REACT_ITERATIONS};
pub use trim::{split_segments, trim_messages};
pub use usage::UsageAccumulator;
