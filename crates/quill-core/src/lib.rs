//! Shared domain types for the quill orchestration engine.

pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod session;
pub mod store;
pub mod tools;
pub mod usage;

pub use context::RequestContext;
pub use errors::{PersistenceError, ProviderError, RetryClass};
pub use events::{AgentEvent, WireEvent};
