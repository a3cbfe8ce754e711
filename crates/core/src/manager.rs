//! Conversation manager
//!
//! One [`ConversationManager`] per active conversation owns the agent
//! run loop: request → model call → tool dispatch → record → repeat →
//! end of turn. The manager is the only writer to its conversation's
//! journal, which is what keeps sequence ids dense; callers get
//! one-turn-at-a-time ordering and prompt returns, with the turn itself
//! running on a background worker under a per-turn cancel token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use confab_subpub::SubPub;

use crate::error::CoreError;
use crate::llm::{self, Content, LlmService, Role};
use crate::store::{AppendMessage, ConversationStore, MessageKind, StoredMessage};
use crate::stream::{self, StreamSnapshot};
use crate::tools::{ToolContext, ToolRegistry};

/// Maximum number of model/tool rounds in a single turn before the
/// manager gives up with a fatal error entry.
const MAX_TURN_ROUNDS: usize = 50;

/// How long `cancel_conversation` waits for the turn worker to drain.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Prefix marking an assistant-shaped entry as a fatal turn error.
pub const LLM_FAILURE_PREFIX: &str = "LLM request failed:";
/// Error entry text recorded when a turn is cancelled by the user.
pub const TURN_CANCELLED_TEXT: &str = "turn cancelled by user";
/// Error entry text synthesized when hydration finds a turn that died
/// with the previous process.
pub const TURN_INTERRUPTED_TEXT: &str = "turn interrupted by server restart";

/// Determine the journal kind for an LLM message.
pub fn classify_message(message: &llm::Message) -> MessageKind {
    match message.role {
        Role::User => MessageKind::User,
        Role::Assistant => {
            let is_error = message.content.iter().any(|c| match c {
                Content::Text { text } => {
                    text.starts_with(LLM_FAILURE_PREFIX)
                        || text == TURN_CANCELLED_TEXT
                        || text == TURN_INTERRUPTED_TEXT
                }
                _ => false,
            });
            if is_error {
                MessageKind::Error
            } else {
                MessageKind::Agent
            }
        }
        Role::Tool => MessageKind::Tool,
    }
}

/// Extract the UI display records from a message's tool results, paired
/// with their tool names where a matching tool-use block exists.
pub fn extract_display_data(message: &llm::Message) -> Option<serde_json::Value> {
    let mut tool_names = std::collections::HashMap::new();
    for content in &message.content {
        if let Content::ToolUse { id, tool_name, .. } = content {
            tool_names.insert(id.clone(), tool_name.clone());
        }
    }

    let mut records = Vec::new();
    for content in &message.content {
        if let Content::ToolResult {
            tool_use_id,
            display: Some(display),
            ..
        } = content
        {
            records.push(serde_json::json!({
                "tool_use_id": tool_use_id,
                "tool_name": tool_names.get(tool_use_id).cloned().unwrap_or_default(),
                "display": display,
            }));
        }
    }

    if records.is_empty() {
        None
    } else {
        Some(serde_json::Value::Array(records))
    }
}

/// Classify and append a message to the journal in one step. The
/// coordinator's recorder builds on this and adds subscriber
/// notification.
pub async fn record_to_store(
    store: &dyn ConversationStore,
    conversation_id: &str,
    message: llm::Message,
    usage: Option<llm::Usage>,
) -> crate::Result<StoredMessage> {
    let kind = classify_message(&message);
    let display_data = extract_display_data(&message);
    let mut params = AppendMessage::new(conversation_id, kind).with_llm_data(message);
    params.usage_data = usage;
    params.display_data = display_data;
    store.append_message(params).await
}

/// Sink for journal entries produced by a manager. Implemented by the
/// server coordinator, which appends to the store and fans the entry
/// out to stream subscribers.
#[async_trait]
pub trait MessageRecorder: Send + Sync {
    async fn record(
        &self,
        conversation_id: &str,
        message: llm::Message,
        usage: Option<llm::Usage>,
    ) -> Result<StoredMessage>;
}

struct CurrentTurn {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct ManagerState {
    model_id: Option<String>,
    cwd: Option<String>,
    current_turn: Option<CurrentTurn>,
}

/// Per-conversation controller owning the turn loop.
pub struct ConversationManager {
    conversation_id: String,
    store: Arc<dyn ConversationStore>,
    recorder: Arc<dyn MessageRecorder>,
    tools: Arc<ToolRegistry>,
    system_prompt: Option<String>,
    subpub: Arc<SubPub<StreamSnapshot>>,
    state: tokio::sync::Mutex<ManagerState>,
    last_activity: std::sync::Mutex<Instant>,
}

impl ConversationManager {
    pub fn new(
        conversation_id: impl Into<String>,
        store: Arc<dyn ConversationStore>,
        recorder: Arc<dyn MessageRecorder>,
        tools: Arc<ToolRegistry>,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            store,
            recorder,
            tools,
            system_prompt,
            subpub: Arc::new(SubPub::new()),
            state: tokio::sync::Mutex::new(ManagerState::default()),
            last_activity: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// The private bus carrying stream snapshots for this conversation.
    pub fn subpub(&self) -> &Arc<SubPub<StreamSnapshot>> {
        &self.subpub
    }

    /// Advance the activity clock; called on every external touch.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// How long since the manager was last touched.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Reconstruct transient state from the journal on first creation.
    ///
    /// A tail that implies an in-progress turn (the worker died with a
    /// previous process) is terminated with a synthesized error entry;
    /// turns are never resumed across restarts.
    pub async fn hydrate(&self) -> Result<()> {
        let conversation = self.store.get_conversation(&self.conversation_id).await?;
        {
            let mut st = self.state.lock().await;
            st.model_id = conversation.model_id.clone();
            st.cwd = conversation.cwd.clone();
        }

        if let Some(tail) = self.store.latest_message(&self.conversation_id).await? {
            if !stream::is_end_of_turn(&tail) {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    tail_sequence_id = tail.sequence_id,
                    "hydrated mid-turn tail, recording interruption"
                );
                self.recorder
                    .record(
                        &self.conversation_id,
                        llm::Message::assistant(TURN_INTERRUPTED_TEXT, true),
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Accept a user message and start a turn. Preconditions: no turn in
    /// progress and the model matches the conversation's sticky model.
    /// Returns whether this was the conversation's first message; the
    /// turn itself runs on a background worker.
    pub async fn accept_user_message(
        self: &Arc<Self>,
        service: Arc<dyn LlmService>,
        model_id: &str,
        message: llm::Message,
    ) -> Result<bool> {
        self.touch();
        let mut st = self.state.lock().await;

        if st.current_turn.is_some() {
            return Err(CoreError::TurnInProgress(self.conversation_id.clone()).into());
        }
        match &st.model_id {
            Some(existing) if existing != model_id => {
                return Err(CoreError::ModelMismatch {
                    existing: existing.clone(),
                    requested: model_id.to_string(),
                }
                .into());
            }
            Some(_) => {}
            None => {
                // First turn pins the sticky model.
                self.store
                    .set_model_id(&self.conversation_id, model_id)
                    .await?;
                st.model_id = Some(model_id.to_string());
            }
        }

        let is_first = self
            .store
            .latest_message(&self.conversation_id)
            .await?
            .is_none();

        self.recorder
            .record(&self.conversation_id, message, None)
            .await?;

        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        st.current_turn = Some(CurrentTurn {
            token: token.clone(),
            done: done_rx,
        });
        let cwd = st.cwd.clone();
        drop(st);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_turn(service, token, cwd, done_tx).await;
        });

        Ok(is_first)
    }

    /// Cancel the in-flight turn, wait a bounded time for the worker to
    /// drain, and record the cancellation error entry so the end-of-turn
    /// observer stabilizes. A no-op when no turn is running.
    pub async fn cancel_conversation(&self) -> Result<()> {
        self.touch();
        let current = {
            let st = self.state.lock().await;
            st.current_turn
                .as_ref()
                .map(|turn| (turn.token.clone(), turn.done.clone()))
        };
        let Some((token, mut done)) = current else {
            return Ok(());
        };

        token.cancel();
        if tokio::time::timeout(CANCEL_GRACE, done.wait_for(|finished| *finished))
            .await
            .is_err()
        {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                "turn worker did not stop within the cancel grace period"
            );
        }

        self.recorder
            .record(
                &self.conversation_id,
                llm::Message::assistant(TURN_CANCELLED_TEXT, true),
                None,
            )
            .await?;
        Ok(())
    }

    /// Whether a turn is currently running.
    pub async fn turn_in_progress(&self) -> bool {
        self.state.lock().await.current_turn.is_some()
    }

    /// Final shutdown: aborts any in-flight turn without recording.
    pub async fn stop_loop(&self) {
        let st = self.state.lock().await;
        if let Some(turn) = &st.current_turn {
            turn.token.cancel();
        }
    }

    async fn run_turn(
        self: Arc<Self>,
        service: Arc<dyn LlmService>,
        token: CancellationToken,
        cwd: Option<String>,
        done_tx: watch::Sender<bool>,
    ) {
        if let Err(e) = self.turn_loop(service.as_ref(), &token, cwd).await {
            // Cancellation is not an error here: cancel_conversation
            // records the single cancellation entry after we drain.
            if !token.is_cancelled() {
                let text = e.to_string();
                let text = if text.starts_with(LLM_FAILURE_PREFIX) {
                    text
                } else {
                    format!("{LLM_FAILURE_PREFIX} {text}")
                };
                tracing::error!(
                    conversation_id = %self.conversation_id,
                    error = %e,
                    "turn failed"
                );
                if let Err(record_err) = self
                    .recorder
                    .record(
                        &self.conversation_id,
                        llm::Message::assistant(text, true),
                        None,
                    )
                    .await
                {
                    tracing::error!(
                        conversation_id = %self.conversation_id,
                        error = %record_err,
                        "failed to record turn error"
                    );
                }
            }
        }

        let mut st = self.state.lock().await;
        st.current_turn = None;
        drop(st);
        let _ = done_tx.send(true);
    }

    async fn turn_loop(
        &self,
        service: &dyn LlmService,
        token: &CancellationToken,
        cwd: Option<String>,
    ) -> Result<()> {
        for round in 0..MAX_TURN_ROUNDS {
            let stored = self.store.list_messages(&self.conversation_id).await?;
            let history: Vec<llm::Message> = stored
                .iter()
                .filter(|m| {
                    matches!(
                        m.kind,
                        MessageKind::User | MessageKind::Agent | MessageKind::Tool
                    )
                })
                .filter_map(|m| m.llm_data.clone())
                .collect();
            let request = llm::Request {
                messages: history,
                system: self.system_prompt.clone(),
                tools: self.tools.definitions(),
            };

            let response = tokio::select! {
                result = service.complete(token, request) => result?,
                _ = token.cancelled() => return Ok(()),
            };
            if token.is_cancelled() {
                return Ok(());
            }

            let agent_message = response.message;
            tracing::info!(
                conversation_id = %self.conversation_id,
                round,
                content_items = agent_message.content.len(),
                end_of_turn = agent_message.end_of_turn,
                "agent message"
            );
            self.recorder
                .record(
                    &self.conversation_id,
                    agent_message.clone(),
                    Some(response.usage),
                )
                .await?;
            self.touch();

            let tool_uses = agent_message.tool_uses();
            if tool_uses.is_empty() {
                return Ok(());
            }

            // Dispatch every tool use of this agent message in parallel;
            // per-action timeouts are the tools' own concern.
            let ctx = ToolContext::new(&self.conversation_id)
                .with_cwd(cwd.clone())
                .with_cancel(token.clone());
            let runs = tool_uses.into_iter().map(|tool_use| {
                let ctx = ctx.clone();
                let tools = &self.tools;
                async move {
                    let out = tools
                        .run(&ctx, &tool_use.tool_name, tool_use.input.clone())
                        .await;
                    (tool_use, out)
                }
            });
            let outcomes = futures::future::join_all(runs).await;
            if token.is_cancelled() {
                return Ok(());
            }

            let content: Vec<Content> = outcomes
                .into_iter()
                .map(|(tool_use, out)| Content::ToolResult {
                    tool_use_id: tool_use.id,
                    content: out.content,
                    is_error: out.is_error,
                    display: out.display,
                })
                .collect();
            let tool_message = llm::Message {
                role: Role::Tool,
                content,
                end_of_turn: false,
            };
            self.recorder
                .record(&self.conversation_id, tool_message, None)
                .await?;
            self.touch();
        }

        anyhow::bail!("exceeded maximum of {MAX_TURN_ROUNDS} tool rounds in a single turn")
    }
}
