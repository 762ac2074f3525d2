pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod tools;
pub mod usage;

#[cfg(test)]
mod testing;

pub use error::EngineError;
pub use executor::{ToolBatch, ToolExecutor};
pub use orchestrator::{AgentOrchestrator, EngineOrchestrator, RunRequest};
pub use registry::ToolRegistry;
pub use runner::{ConversationLoop, LoopConfig};
pub use usage::UsageTracker;
