use async_trait::async_trait;
use rusqlite::OptionalExtension;
use tracing::instrument;

use quill_core::errors::PersistenceError;
use quill_core::ids::{MessageId, SessionId};
use quill_core::messages::{ContentPart, FinishReason, Message, Role};
use quill_core::store::MessageStore;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_timestamp};

const MESSAGE_COLUMNS: &str =
    "id, session_id, role, parts, finish_reason, model, created_at, updated_at";

/// Messages with their content parts stored as a JSON array.
#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, message), fields(session_id = %message.session_id, message_id = %message.id))]
    pub fn create(&self, message: &Message) -> Result<(), StoreError> {
        let parts = serde_json::to_string(&message.parts)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, session_id, role, parts, finish_reason, model, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    message.id.as_str(),
                    message.session_id.as_str(),
                    message.role.as_str(),
                    parts,
                    message.finish_reason.map(|r| r.as_str()),
                    message.model,
                    format_timestamp(&message.created_at),
                    format_timestamp(&message.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Overwrite parts, finish reason, model, and `updated_at`.
    #[instrument(skip(self, message), fields(session_id = %message.session_id, message_id = %message.id))]
    pub fn update(&self, message: &Message) -> Result<(), StoreError> {
        let parts = serde_json::to_string(&message.parts)?;
        self.db.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE messages SET parts = ?1, finish_reason = ?2, model = ?3, updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    parts,
                    message.finish_reason.map(|r| r.as_str()),
                    message.model,
                    format_timestamp(&message.updated_at),
                    message.id.as_str(),
                ],
            )?;
            if affected == 0 {
                return Err(StoreError::NotFound(format!("message {}", message.id)));
            }
            Ok(())
        })
    }

    /// Every message of a session, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: &MessageId) -> Result<Message, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;
            stmt.query_row([id.as_str()], |row| Ok(row_to_message(row)))
                .optional()?
                .unwrap_or_else(|| Err(StoreError::NotFound(format!("message {id}"))))
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn delete(&self, id: &MessageId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let affected = conn.execute("DELETE FROM messages WHERE id = ?1", [id.as_str()])?;
            if affected == 0 {
                return Err(StoreError::NotFound(format!("message {id}")));
            }
            Ok(())
        })
    }
}

#[async_trait]
impl MessageStore for MessageRepo {
    async fn create(&self, message: &Message) -> Result<(), PersistenceError> {
        Ok(MessageRepo::create(self, message)?)
    }

    async fn update(&self, message: &Message) -> Result<(), PersistenceError> {
        Ok(MessageRepo::update(self, message)?)
    }

    async fn list(&self, session_id: &SessionId) -> Result<Vec<Message>, PersistenceError> {
        Ok(MessageRepo::list(self, session_id)?)
    }

    async fn get(&self, id: &MessageId) -> Result<Message, PersistenceError> {
        Ok(MessageRepo::get(self, id)?)
    }

    async fn delete(&self, id: &MessageId) -> Result<(), PersistenceError> {
        Ok(MessageRepo::delete(self, id)?)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let role_str: String = row_helpers::get(row, 2, "messages", "role")?;
    let role = Role::parse(&role_str).ok_or_else(|| StoreError::CorruptRow {
        table: "messages",
        column: "role",
        detail: format!("unknown variant: {role_str}"),
    })?;
    let parts_raw: String = row_helpers::get(row, 3, "messages", "parts")?;
    let parts: Vec<ContentPart> = row_helpers::parse_json(&parts_raw, "messages", "parts")?;
    let created: String = row_helpers::get(row, 6, "messages", "created_at")?;
    let updated: String = row_helpers::get(row, 7, "messages", "updated_at")?;

    Ok(Message {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "messages", "session_id")?),
        role,
        parts,
        finish_reason: row_helpers::get_opt::<String>(row, 4, "messages", "finish_reason")?
            .map(|s| FinishReason::parse(&s)),
        model: row_helpers::get_opt(row, 5, "messages", "model")?,
        created_at: row_helpers::parse_timestamp(&created, "messages", "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated, "messages", "updated_at")?,
    })
}
