use std::sync::Arc;

use tracing::{debug, instrument};

use quill_core::errors::PersistenceError;
use quill_core::ids::SessionId;
use quill_core::session::Session;
use quill_core::store::SessionStore;
use quill_core::usage::TokenUsage;
use quill_llm::models;

/// Folds one turn's token usage into the session's billing counters.
///
/// Cost accumulates across turns. The token counters are overwritten with the
/// latest turn's values.
#[derive(Clone)]
pub struct UsageTracker {
    sessions: Arc<dyn SessionStore>,
}

impl UsageTracker {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }

    #[instrument(skip(self, usage), fields(session_id = %session_id, model = model_id))]
    pub async fn track(
        &self,
        session_id: &SessionId,
        model_id: &str,
        usage: &TokenUsage,
    ) -> Result<Session, PersistenceError> {
        let cost = models::pricing_for(model_id).cost(usage);
        let mut session = self.sessions.get(session_id).await?;
        session.cost += cost;
        session.prompt_tokens = usage.prompt_tokens();
        session.completion_tokens = usage.completion_tokens();
        self.sessions.save(&session).await?;
        debug!(cost, total_cost = session.cost, "usage tracked");
        Ok(session)
    }
}
