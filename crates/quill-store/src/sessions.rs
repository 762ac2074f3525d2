use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use quill_core::errors::PersistenceError;
use quill_core::ids::SessionId;
use quill_core::session::Session;
use quill_core::store::SessionStore;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_timestamp};

const SESSION_COLUMNS: &str =
    "id, title, cost, prompt_tokens, completion_tokens, created_at, updated_at";

#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new session with a fresh id.
    #[instrument(skip(self))]
    pub fn create(&self, title: &str) -> Result<Session, StoreError> {
        let session = Session::new(SessionId::new(), title);
        self.insert(&session)?;
        Ok(session)
    }

    /// Fetch a session, creating it with the given id if it does not exist.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get_or_create(&self, id: &SessionId, title: &str) -> Result<Session, StoreError> {
        match self.find(id)? {
            Some(session) => Ok(session),
            None => {
                let session = Session::new(id.clone(), title);
                self.insert(&session)?;
                Ok(session)
            }
        }
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn find(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let row = stmt.query_row([id.as_str()], |row| Ok(row_to_session(row))).optional()?;
            row.transpose()
        })
    }

    /// Get a session by ID.
    pub fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    /// Persist title, cost, and token counters. Unknown sessions are inserted.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub fn save(&self, session: &Session) -> Result<(), StoreError> {
        let now = Utc::now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, title, cost, prompt_tokens, completion_tokens, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    cost = excluded.cost,
                    prompt_tokens = excluded.prompt_tokens,
                    completion_tokens = excluded.completion_tokens,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    session.id.as_str(),
                    session.title,
                    session.cost,
                    session.prompt_tokens as i64,
                    session.completion_tokens as i64,
                    format_timestamp(&session.created_at),
                    format_timestamp(&now),
                ],
            )?;
            Ok(())
        })
    }

    fn insert(&self, session: &Session) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, title, cost, prompt_tokens, completion_tokens, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    session.id.as_str(),
                    session.title,
                    session.cost,
                    session.prompt_tokens as i64,
                    session.completion_tokens as i64,
                    format_timestamp(&session.created_at),
                    format_timestamp(&session.updated_at),
                ],
            )?;
            Ok(())
        })
    }
}

#[async_trait]
impl SessionStore for SessionRepo {
    async fn get(&self, id: &SessionId) -> Result<Session, PersistenceError> {
        Ok(SessionRepo::get(self, id)?)
    }

    async fn save(&self, session: &Session) -> Result<(), PersistenceError> {
        Ok(SessionRepo::save(self, session)?)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let created: String = row_helpers::get(row, 5, "sessions", "created_at")?;
    let updated: String = row_helpers::get(row, 6, "sessions", "updated_at")?;
    Ok(Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        title: row_helpers::get(row, 1, "sessions", "title")?,
        cost: row_helpers::get(row, 2, "sessions", "cost")?,
        prompt_tokens: row_helpers::get::<i64>(row, 3, "sessions", "prompt_tokens")? as u64,
        completion_tokens: row_helpers::get::<i64>(row, 4, "sessions", "completion_tokens")? as u64,
        created_at: row_helpers::parse_timestamp(&created, "sessions", "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated, "sessions", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_session() {
        let repo = repo();
        let session = repo.create("Draft").unwrap();
        assert!(session.id.as_str().starts_with("sess_"));
        assert_eq!(session.title, "Draft");
        assert_eq!(session.cost, 0.0);
    }

    #[test]
    fn get_session() {
        let repo = repo();
        let session = repo.create("Draft").unwrap();
        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.title, "Draft");
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = repo();
        let result = repo.get(&SessionId::from_raw("sess_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn get_or_create_is_stable() {
        let repo = repo();
        let id = SessionId::from_raw("sess_fixed");
        let first = repo.get_or_create(&id, "one").unwrap();
        let second = repo.get_or_create(&id, "two").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.title, "one");
    }

    #[test]
    fn save_updates_counters() {
        let repo = repo();
        let mut session = repo.create("Draft").unwrap();
        session.cost = 0.25;
        session.prompt_tokens = 1200;
        session.completion_tokens = 300;
        repo.save(&session).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert!((fetched.cost - 0.25).abs() < f64::EPSILON);
        assert_eq!(fetched.prompt_tokens, 1200);
        assert_eq!(fetched.completion_tokens, 300);
        assert!(fetched.updated_at >= session.updated_at);
    }

    #[test]
    fn save_inserts_unknown_session() {
        let repo = repo();
        let session = Session::new(SessionId::from_raw("sess_new"), "fresh");
        repo.save(&session).unwrap();
        assert_eq!(repo.get(&session.id).unwrap().title, "fresh");
    }

    #[test]
    fn corrupt_timestamp_is_reported() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, title, created_at, updated_at)
                 VALUES ('sess_bad', '', 'not-a-date', 'not-a-date')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = SessionRepo::new(db);
        let result = repo.get(&SessionId::from_raw("sess_bad"));
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }

    #[tokio::test]
    async fn session_store_maps_not_found() {
        let repo = repo();
        let store: &dyn SessionStore = &repo;
        let err = store.get(&SessionId::from_raw("missing")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }
}
