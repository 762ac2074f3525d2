//! Persistence boundaries the engine depends on.

use async_trait::async_trait;

use crate::errors::PersistenceError;
use crate::ids::{MessageId, SessionId};
use crate::messages::Message;
use crate::session::Session;

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: &Message) -> Result<(), PersistenceError>;
    /// Overwrites the stored parts, finish reason and `updated_at`.
    async fn update(&self, message: &Message) -> Result<(), PersistenceError>;
    /// Every message of a session, oldest first.
    async fn list(&self, session_id: &SessionId) -> Result<Vec<Message>, PersistenceError>;
    async fn get(&self, id: &MessageId) -> Result<Message, PersistenceError>;
    async fn delete(&self, id: &MessageId) -> Result<(), PersistenceError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &SessionId) -> Result<Session, PersistenceError>;
    async fn save(&self, session: &Session) -> Result<(), PersistenceError>;
}
