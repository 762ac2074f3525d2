use quill_core::errors::{PersistenceError, ProviderError};
use quill_core::ids::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session is currently processing another request: {0}")]
    SessionBusy(SessionId),

    #[error("request cancelled by user")]
    Cancelled,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Cancellation may arrive either directly or through the provider stream.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Provider(e) => e.is_cancelled(),
            _ => false,
        }
    }
}
