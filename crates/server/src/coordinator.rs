//! Server coordinator
//!
//! Owns the `conversation_id → manager` map. Manager creation is
//! single-flighted through a per-id once-cell so simultaneous callers
//! hydrate exactly one manager. Every recorded message is fanned out to
//! that conversation's bus on a detached task, so SSE clients still
//! receive the event after the originating POST handler has returned.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use confab_core::llm::{self, LlmProvider, Role};
use confab_core::manager::{record_to_store, ConversationManager, MessageRecorder};
use confab_core::slug;
use confab_core::store::{ConversationStore, StoredMessage};
use confab_core::stream::{
    self, ApiMessage, ConversationListUpdate, StreamSnapshot,
};
use confab_core::tools::ToolRegistry;

/// How often the eviction sweep runs.
const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Managers idle longer than this are evicted by the sweep.
pub const DEFAULT_MANAGER_IDLE: Duration = Duration::from_secs(30 * 60);

/// Outer budget for the detached slug-generation task.
const SLUG_TASK_BUDGET: Duration = Duration::from_secs(15);

type ManagerCell = Arc<OnceCell<Arc<ConversationManager>>>;

pub struct Coordinator {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    system_prompt: Option<String>,
    default_model: String,
    active: DashMap<String, ManagerCell>,
    manager_idle: Duration,
    weak: Weak<Coordinator>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        system_prompt: Option<String>,
        default_model: impl Into<String>,
        manager_idle: Duration,
    ) -> Arc<Self> {
        let default_model = default_model.into();
        Arc::new_cyclic(|weak| Self {
            store,
            provider,
            tools,
            system_prompt,
            default_model,
            active: DashMap::new(),
            manager_idle,
            weak: weak.clone(),
        })
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Get the active manager for a conversation, or create and hydrate
    /// exactly one, however many callers race here.
    pub async fn get_or_create_manager(
        self: &Arc<Self>,
        conversation_id: &str,
    ) -> Result<Arc<ConversationManager>> {
        let cell = self
            .active
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let manager = cell
            .get_or_try_init(|| async {
                let manager = Arc::new(ConversationManager::new(
                    conversation_id,
                    self.store.clone(),
                    Arc::clone(self) as Arc<dyn MessageRecorder>,
                    self.tools.clone(),
                    self.system_prompt.clone(),
                ));
                manager.hydrate().await?;
                Ok::<_, anyhow::Error>(manager)
            })
            .await?;

        manager.touch();
        Ok(manager.clone())
    }

    /// The manager, only if one is currently active.
    pub fn manager_if_active(&self, conversation_id: &str) -> Option<Arc<ConversationManager>> {
        self.active
            .get(conversation_id)
            .and_then(|cell| cell.get().cloned())
    }

    /// Drop a manager from the active map, stopping its loop.
    pub async fn remove_manager(&self, conversation_id: &str) {
        if let Some((_, cell)) = self.active.remove(conversation_id) {
            if let Some(manager) = cell.get() {
                manager.stop_loop().await;
            }
        }
    }

    /// Periodic sweep that evicts idle managers.
    pub fn spawn_eviction_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVICTION_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                coordinator.sweep_idle_managers().await;
            }
        })
    }

    /// Evict managers whose last activity is older than the idle limit.
    pub async fn sweep_idle_managers(&self) {
        let mut evict = Vec::new();
        for entry in self.active.iter() {
            if let Some(manager) = entry.value().get() {
                if manager.idle_for() > self.manager_idle {
                    evict.push(entry.key().clone());
                }
            }
        }
        for conversation_id in evict {
            self.remove_manager(&conversation_id).await;
            tracing::debug!(conversation_id = %conversation_id, "cleaned up inactive conversation");
        }
    }

    /// Broadcast a conversation-list update to every active stream, so
    /// clients learn about changes to conversations they are not
    /// currently subscribed to.
    pub fn publish_list_update(&self, update: ConversationListUpdate) {
        let snapshot = StreamSnapshot {
            conversation_list_update: Some(update),
            ..Default::default()
        };
        for entry in self.active.iter() {
            if let Some(manager) = entry.value().get() {
                manager.subpub().broadcast(snapshot.clone());
            }
        }
    }

    /// Notify subscribers about a conversation-metadata change (e.g. a
    /// slug arriving) without any new messages.
    pub async fn notify_conversation_update(&self, conversation_id: &str) {
        let conversation = match self.store.get_conversation(conversation_id).await {
            Ok(conversation) => conversation,
            Err(e) => {
                tracing::error!(conversation_id, error = %e, "failed to load conversation for notification");
                return;
            }
        };

        if let Some(manager) = self.manager_if_active(conversation_id) {
            let latest = self
                .store
                .latest_message(conversation_id)
                .await
                .ok()
                .flatten()
                .map(|m| m.sequence_id)
                .unwrap_or(-1);
            manager.subpub().publish(
                latest,
                StreamSnapshot {
                    conversation: Some(conversation.clone()),
                    ..Default::default()
                },
            );
        }

        self.publish_list_update(ConversationListUpdate::update(conversation));
    }

    async fn notify_new_message(&self, conversation_id: &str, stored: StoredMessage) {
        let conversation = match self.store.get_conversation(conversation_id).await {
            Ok(conversation) => conversation,
            Err(e) => {
                tracing::error!(conversation_id, error = %e, "failed to load conversation for notification");
                return;
            }
        };

        let agent_working = !stream::is_end_of_turn(&stored);
        let sequence_id = stored.sequence_id;
        let context_window_size = stream::context_window_size_from(&stored);
        let snapshot = StreamSnapshot {
            messages: vec![ApiMessage::from(stored)],
            conversation: Some(conversation.clone()),
            agent_working,
            // 0 for entries without usage data; omitted on the wire so
            // observers keep their previous value.
            context_window_size,
            conversation_list_update: None,
        };

        if let Some(manager) = self.manager_if_active(conversation_id) {
            manager.subpub().publish(sequence_id, snapshot);
        }

        // Activity changed the list ordering too.
        self.publish_list_update(ConversationListUpdate::update(conversation));
    }

    /// Fire the first-message slug side-effect on a detached task. Slug
    /// failures are logged and never fatal to the conversation.
    pub fn fire_slug_generation(
        self: &Arc<Self>,
        conversation_id: String,
        user_message: String,
        model_id: String,
    ) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let generated = tokio::time::timeout(
                SLUG_TASK_BUDGET,
                slug::generate_slug(
                    coordinator.provider.as_ref(),
                    coordinator.store.as_ref(),
                    &conversation_id,
                    &user_message,
                    &model_id,
                ),
            )
            .await;
            match generated {
                Ok(Ok(_)) => {
                    coordinator.notify_conversation_update(&conversation_id).await;
                }
                Ok(Err(e)) => {
                    tracing::warn!(conversation_id = %conversation_id, error = %e, "failed to generate slug for conversation");
                }
                Err(_) => {
                    tracing::warn!(conversation_id = %conversation_id, "slug generation timed out");
                }
            }
        });
    }
}

#[async_trait]
impl MessageRecorder for Coordinator {
    async fn record(
        &self,
        conversation_id: &str,
        message: llm::Message,
        usage: Option<llm::Usage>,
    ) -> Result<StoredMessage> {
        match message.role {
            Role::User => tracing::info!(
                conversation_id,
                content_items = message.content.len(),
                "user message"
            ),
            Role::Assistant => tracing::info!(
                conversation_id,
                content_items = message.content.len(),
                end_of_turn = message.end_of_turn,
                "agent message"
            ),
            Role::Tool => {}
        }

        let stored = record_to_store(self.store.as_ref(), conversation_id, message, usage).await?;

        if let Some(manager) = self.manager_if_active(conversation_id) {
            manager.touch();
        }

        // Notify on a detached task: the originating request may have
        // returned (and its context gone) before SSE clients are served.
        if let Some(coordinator) = self.weak.upgrade() {
            let conversation_id = conversation_id.to_string();
            let stored = stored.clone();
            tokio::spawn(async move {
                coordinator.notify_new_message(&conversation_id, stored).await;
            });
        }

        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_core::llm::{Message, ModelRegistry, PredictableService};
    use confab_core::store::{MemoryStore, MessageKind};
    use tokio_util::sync::CancellationToken;

    fn test_coordinator(manager_idle: Duration) -> (Arc<Coordinator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(ModelRegistry::new());
        provider.register(
            llm::PREDICTABLE_MODEL_ID,
            "slug",
            Arc::new(PredictableService::new()),
        );
        let coordinator = Coordinator::new(
            store.clone(),
            provider,
            Arc::new(ToolRegistry::new()),
            None,
            llm::PREDICTABLE_MODEL_ID,
            manager_idle,
        );
        (coordinator, store)
    }

    #[tokio::test]
    async fn concurrent_lookups_create_one_manager() {
        let (coordinator, store) = test_coordinator(DEFAULT_MANAGER_IDLE);
        let conversation = store.create_conversation(None, None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let id = conversation.conversation_id.clone();
            handles.push(tokio::spawn(async move {
                coordinator.get_or_create_manager(&id).await.unwrap()
            }));
        }

        let managers: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        for manager in &managers[1..] {
            assert!(Arc::ptr_eq(&managers[0], manager));
        }
        assert_eq!(coordinator.active.len(), 1);
    }

    #[tokio::test]
    async fn recorded_message_reaches_subscriber() {
        let (coordinator, store) = test_coordinator(DEFAULT_MANAGER_IDLE);
        let conversation = store.create_conversation(None, None).await.unwrap();
        let manager = coordinator
            .get_or_create_manager(&conversation.conversation_id)
            .await
            .unwrap();

        let token = CancellationToken::new();
        let mut subscription = manager.subpub().subscribe(&token, -1);

        coordinator
            .record(
                &conversation.conversation_id,
                Message::user("hello"),
                None,
            )
            .await
            .unwrap();

        let snapshot = subscription.next().await.expect("snapshot delivered");
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].kind, MessageKind::User);
        assert_eq!(snapshot.messages[0].sequence_id, 0);
        assert!(snapshot.agent_working);
        assert_eq!(snapshot.context_window_size, 0);
    }

    #[tokio::test]
    async fn list_updates_broadcast_to_other_conversations() {
        let (coordinator, store) = test_coordinator(DEFAULT_MANAGER_IDLE);
        let a = store.create_conversation(None, None).await.unwrap();
        let b = store.create_conversation(None, None).await.unwrap();
        let _manager_a = coordinator
            .get_or_create_manager(&a.conversation_id)
            .await
            .unwrap();
        let manager_b = coordinator
            .get_or_create_manager(&b.conversation_id)
            .await
            .unwrap();

        let token = CancellationToken::new();
        let mut sub_b = manager_b.subpub().subscribe(&token, 100);

        let archived = store.archive(&a.conversation_id).await.unwrap();
        coordinator.publish_list_update(ConversationListUpdate::update(archived));

        let snapshot = sub_b.next().await.expect("broadcast delivered");
        let update = snapshot.conversation_list_update.expect("list update set");
        assert_eq!(update.update_type, "update");
        assert_eq!(
            update.conversation.unwrap().conversation_id,
            a.conversation_id
        );
    }

    #[tokio::test]
    async fn sweep_evicts_idle_managers() {
        let (coordinator, store) = test_coordinator(Duration::ZERO);
        let conversation = store.create_conversation(None, None).await.unwrap();
        coordinator
            .get_or_create_manager(&conversation.conversation_id)
            .await
            .unwrap();
        assert_eq!(coordinator.active.len(), 1);

        // Any elapsed time exceeds a zero idle limit.
        tokio::time::sleep(Duration::from_millis(5)).await;
        coordinator.sweep_idle_managers().await;
        assert_eq!(coordinator.active.len(), 0);

        // The conversation itself survives eviction.
        assert!(store
            .get_conversation(&conversation.conversation_id)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn slug_side_effect_assigns_and_notifies() {
        let (coordinator, store) = test_coordinator(DEFAULT_MANAGER_IDLE);
        let conversation = store.create_conversation(None, None).await.unwrap();
        let manager = coordinator
            .get_or_create_manager(&conversation.conversation_id)
            .await
            .unwrap();

        let token = CancellationToken::new();
        let mut subscription = manager.subpub().subscribe(&token, 100);

        coordinator.fire_slug_generation(
            conversation.conversation_id.clone(),
            "set up my deploy pipeline".to_string(),
            llm::PREDICTABLE_MODEL_ID.to_string(),
        );

        // The broadcast list update carries the freshly slugged row.
        let snapshot = subscription.next().await.expect("notification delivered");
        let update = snapshot.conversation_list_update.expect("list update set");
        assert!(update.conversation.unwrap().slug.is_some());

        let row = store
            .get_conversation(&conversation.conversation_id)
            .await
            .unwrap();
        assert!(row.slug.is_some());
    }
}
