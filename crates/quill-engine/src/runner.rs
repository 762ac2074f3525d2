use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use quill_core::context::RequestContext;
use quill_core::events::AgentEvent;
use quill_core::ids::SessionId;
use quill_core::messages::{Attachment, ContentPart, FinishReason, Message, Role};
use quill_core::provider::ProviderEvent;
use quill_core::store::{MessageStore, SessionStore};
use quill_core::tools::ToolInfo;
use quill_llm::StreamingClient;

use crate::error::EngineError;
use crate::executor::ToolExecutor;
use crate::registry::ToolRegistry;
use crate::usage::UsageTracker;

pub const MAX_ITERATIONS_MESSAGE: &str = "I've made several edits to your document. Let me know if you'd like me to continue with additional changes.";

/// Configuration for the conversation loop.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Model turns allowed per run before the loop closes with a fixed reply.
    pub max_iterations: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { max_iterations: 25 }
    }
}

/// How one model turn ended.
enum Turn {
    Done(Message),
    ToolUse { assistant: Message, tools: Message },
}

/// The agentic loop: stream a model turn, run requested tools, feed the
/// results back, and repeat until the model stops asking for tools.
pub struct ConversationLoop {
    client: Arc<StreamingClient>,
    executor: ToolExecutor,
    messages: Arc<dyn MessageStore>,
    usage: UsageTracker,
    config: LoopConfig,
}

impl ConversationLoop {
    pub fn new(
        client: Arc<StreamingClient>,
        registry: Arc<ToolRegistry>,
        messages: Arc<dyn MessageStore>,
        sessions: Arc<dyn SessionStore>,
        config: LoopConfig,
    ) -> Self {
        Self {
            client,
            executor: ToolExecutor::new(registry),
            messages,
            usage: UsageTracker::new(sessions),
            config,
        }
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// Drive one run to completion. Intermediate events go to `events`; the
    /// single terminal event is returned to the caller.
    #[instrument(skip_all, fields(session_id = %ctx.session_id))]
    pub async fn run(
        &self,
        ctx: &RequestContext,
        content: String,
        attachments: Vec<Attachment>,
        events: &mpsc::Sender<AgentEvent>,
    ) -> AgentEvent {
        let sid = ctx.session_id.clone();

        let mut history = match self.messages.list(&sid).await {
            Ok(history) => history,
            Err(e) => return AgentEvent::error(sid, format!("failed to list messages: {e}")),
        };
        let user = Message::user(sid.clone(), content, attachments);
        if let Err(e) = self.messages.create(&user).await {
            return AgentEvent::error(sid, format!("failed to create user message: {e}"));
        }
        history.push(user);

        let tools = self.executor.registry().tool_infos();
        let mut iteration = 0u32;
        loop {
            if ctx.is_cancelled() {
                return AgentEvent::cancelled(sid);
            }

            iteration += 1;
            if iteration > self.config.max_iterations {
                warn!(max_iterations = self.config.max_iterations, "iteration cap reached, closing run");
                return self.close_after_cap(&sid).await;
            }
            emit(events, AgentEvent::thinking(sid.clone(), iteration)).await;
            log_history(iteration, &history);

            match self.stream_turn(ctx, &history, &tools, events).await {
                Ok(Turn::Done(message)) => {
                    return AgentEvent::Response {
                        session_id: sid,
                        message,
                        done: true,
                    };
                }
                Ok(Turn::ToolUse { assistant, tools }) => {
                    debug!(results = tools.parts.len(), "tool batch finished");
                    emit(
                        events,
                        AgentEvent::Response {
                            session_id: sid.clone(),
                            message: assistant.clone(),
                            done: false,
                        },
                    )
                    .await;
                    emit(
                        events,
                        AgentEvent::Tool {
                            session_id: sid.clone(),
                            message: tools.clone(),
                        },
                    )
                    .await;
                    history.push(assistant);
                    history.push(tools);
                }
                Err(e) if e.is_cancelled() => {
                    info!(iteration, "run cancelled");
                    return AgentEvent::cancelled(sid);
                }
                Err(e) => {
                    return AgentEvent::error(sid, format!("failed to process events: {e}"));
                }
            }
        }
    }

    async fn close_after_cap(&self, sid: &SessionId) -> AgentEvent {
        let mut message = Message::assistant(sid.clone(), Some(self.model().to_string()));
        message.append_content(MAX_ITERATIONS_MESSAGE);
        message.finish(FinishReason::EndTurn);
        if let Err(e) = self.messages.create(&message).await {
            return AgentEvent::error(
                sid.clone(),
                format!(
                    "max iterations reached ({}), failed to create final message: {e}",
                    self.config.max_iterations
                ),
            );
        }
        AgentEvent::Response {
            session_id: sid.clone(),
            message,
            done: true,
        }
    }

    async fn stream_turn(
        &self,
        ctx: &RequestContext,
        history: &[Message],
        tools: &[ToolInfo],
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<Turn, EngineError> {
        let sid = &ctx.session_id;
        let mut assistant = Message::assistant(sid.clone(), Some(self.model().to_string()));
        self.messages
            .create(&assistant)
            .await
            .map_err(|e| EngineError::Internal(format!("failed to create assistant message: {e}")))?;

        let ctx = ctx.for_message(assistant.id.clone());
        let mut stream = self
            .client
            .stream_response(&ctx, history.to_vec(), tools.to_vec());

        while let Some(event) = stream.next().await {
            if let Err(e) = self.handle_event(&ctx, &mut assistant, event, events).await {
                let reason = if e.is_cancelled() {
                    FinishReason::Canceled
                } else {
                    FinishReason::Unknown
                };
                self.finish_with(&mut assistant, reason).await;
                return Err(e);
            }
            if ctx.is_cancelled() {
                self.finish_cancelled(&mut assistant).await;
                return Err(EngineError::Cancelled);
            }
        }

        if !assistant.is_finished() {
            if ctx.is_cancelled() {
                self.finish_cancelled(&mut assistant).await;
                return Err(EngineError::Cancelled);
            }
            self.finish_with(&mut assistant, FinishReason::Unknown).await;
            return Err(EngineError::Internal("provider stream ended without completion".into()));
        }

        let calls = assistant.tool_calls();
        if assistant.finish_reason != Some(FinishReason::ToolUse) || calls.is_empty() {
            return Ok(Turn::Done(assistant));
        }

        let batch = self.executor.execute(&ctx, &calls).await;
        if batch.cancelled {
            self.finish_cancelled(&mut assistant).await;
        }
        let tool_message = Message::tool_results_message(sid.clone(), batch.results);
        self.messages
            .create(&tool_message)
            .await
            .map_err(|e| EngineError::Internal(format!("failed to create tool message: {e}")))?;
        if batch.cancelled {
            return Err(EngineError::Cancelled);
        }

        Ok(Turn::ToolUse {
            assistant,
            tools: tool_message,
        })
    }

    async fn handle_event(
        &self,
        ctx: &RequestContext,
        assistant: &mut Message,
        event: ProviderEvent,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<(), EngineError> {
        let sid = &ctx.session_id;
        match event {
            ProviderEvent::ThinkingDelta { delta } => {
                assistant.append_reasoning(&delta);
                self.persist(assistant).await;
                emit(
                    events,
                    AgentEvent::ReasoningDelta {
                        session_id: sid.clone(),
                        delta,
                    },
                )
                .await;
            }
            ProviderEvent::ContentStart | ProviderEvent::ToolUseDelta { .. } => {}
            ProviderEvent::ContentDelta { delta } => {
                assistant.append_content(&delta);
                self.persist(assistant).await;
                emit(
                    events,
                    AgentEvent::ContentDelta {
                        session_id: sid.clone(),
                        delta,
                    },
                )
                .await;
            }
            ProviderEvent::ToolUseStart { call } => {
                debug!(tool = %call.name, "tool call started");
                assistant.add_tool_call(call);
                self.persist(assistant).await;
            }
            ProviderEvent::ToolUseStop { id } => {
                assistant.finish_tool_call(&id);
                self.persist(assistant).await;
            }
            ProviderEvent::Error(e) => return Err(e.into()),
            ProviderEvent::Complete(response) => {
                debug!(
                    finish_reason = ?response.finish_reason,
                    tool_calls = response.tool_calls.len(),
                    "model turn complete"
                );
                assistant.set_tool_calls(response.tool_calls);
                assistant.finish(response.finish_reason.unwrap_or(FinishReason::EndTurn));
                self.persist(assistant).await;
                if let Err(e) = self.usage.track(sid, self.model(), &response.usage).await {
                    warn!(error = %e, "failed to track usage");
                }
            }
        }
        Ok(())
    }

    async fn finish_cancelled(&self, message: &mut Message) {
        message.cancel();
        self.persist(message).await;
    }

    async fn finish_with(&self, message: &mut Message, reason: FinishReason) {
        message.finish(reason);
        self.persist(message).await;
    }

    async fn persist(&self, message: &Message) {
        if let Err(e) = self.messages.update(message).await {
            warn!(message_id = %message.id, error = %e, "failed to update message");
        }
    }
}

async fn emit(events: &mpsc::Sender<AgentEvent>, event: AgentEvent) {
    if events.send(event).await.is_err() {
        debug!("event receiver dropped");
    }
}

fn log_history(iteration: u32, history: &[Message]) {
    let count = |role: Role| history.iter().filter(|m| m.role == role).count();
    let attachments: usize = history
        .iter()
        .flat_map(|m| &m.parts)
        .filter(|p| matches!(p, ContentPart::Binary(_)))
        .count();
    debug!(
        iteration,
        user = count(Role::User),
        assistant = count(Role::Assistant),
        tool = count(Role::Tool),
        attachments,
        "sending history to model"
    );
}
