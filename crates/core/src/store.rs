//! Conversation and message persistence
//!
//! Provides pluggable storage via the [`ConversationStore`] trait. The
//! contract every backend must honor:
//!
//! - `sequence_id` is dense per conversation: strictly increasing from
//!   0, gap-free, unique on `(conversation_id, sequence_id)`.
//! - Appending a message advances the conversation's `updated_at`;
//!   archive, unarchive, and slug renames do NOT (list ordering must
//!   reflect activity, not housekeeping).
//! - `slug` uniqueness is enforced only over non-NULL values; any number
//!   of NULL slugs coexist.
//!
//! [`MemoryStore`] is the reference backend. SQL backends implement the
//! same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::llm;

/// A conversation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub slug: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

/// Message kinds in the conversation journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Agent,
    Tool,
    Error,
    #[serde(rename = "gitinfo")]
    GitInfo,
}

/// An append-only journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub sequence_id: i64,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_data: Option<llm::Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_data: Option<llm::Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for appending a message.
#[derive(Debug, Clone)]
pub struct AppendMessage {
    pub conversation_id: String,
    pub kind: MessageKind,
    pub llm_data: Option<llm::Message>,
    pub user_data: Option<serde_json::Value>,
    pub usage_data: Option<llm::Usage>,
    pub display_data: Option<serde_json::Value>,
}

impl AppendMessage {
    pub fn new(conversation_id: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            kind,
            llm_data: None,
            user_data: None,
            usage_data: None,
            display_data: None,
        }
    }

    pub fn with_llm_data(mut self, message: llm::Message) -> Self {
        self.llm_data = Some(message);
        self
    }

    pub fn with_usage(mut self, usage: llm::Usage) -> Self {
        self.usage_data = Some(usage);
        self
    }

    pub fn with_display_data(mut self, display: serde_json::Value) -> Self {
        self.display_data = Some(display);
        self
    }
}

/// Storage trait for conversations and their journals.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        slug: Option<String>,
        cwd: Option<String>,
    ) -> Result<Conversation>;

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation>;

    async fn get_conversation_by_slug(&self, slug: &str) -> Result<Conversation>;

    /// Non-archived conversations ordered by `updated_at` descending.
    async fn list_conversations(&self, limit: usize, offset: usize) -> Result<Vec<Conversation>>;

    /// Non-archived conversations whose slug contains `query`, ordered
    /// by `updated_at` descending.
    async fn search_conversations(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Conversation>>;

    /// Archived conversations ordered by `updated_at` descending (the
    /// last activity time, never the archive time).
    async fn list_archived(&self, limit: usize, offset: usize) -> Result<Vec<Conversation>>;

    async fn search_archived(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Conversation>>;

    async fn count_conversations(&self) -> Result<usize>;

    /// Sets a non-NULL slug. Fails with [`CoreError::SlugConflict`] when
    /// another conversation already holds it. Does not touch `updated_at`.
    async fn update_slug(&self, conversation_id: &str, slug: &str) -> Result<Conversation>;

    /// Does not touch `updated_at`.
    async fn archive(&self, conversation_id: &str) -> Result<Conversation>;

    /// Does not touch `updated_at`.
    async fn unarchive(&self, conversation_id: &str) -> Result<Conversation>;

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;

    async fn update_cwd(&self, conversation_id: &str, cwd: &str) -> Result<Conversation>;

    /// Pins the sticky model of the first turn.
    async fn set_model_id(&self, conversation_id: &str, model_id: &str) -> Result<Conversation>;

    /// Appends a journal entry, assigning the next dense `sequence_id`
    /// and advancing the conversation's `updated_at` in one step.
    async fn append_message(&self, params: AppendMessage) -> Result<StoredMessage>;

    /// All messages of a conversation ordered by `sequence_id`.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>>;

    /// The journal tail, if any.
    async fn latest_message(&self, conversation_id: &str) -> Result<Option<StoredMessage>>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory [`ConversationStore`]. A single mutex serializes appends,
/// which is what keeps `sequence_id` dense under concurrency.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<StoredMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreInner {
    fn require(&self, conversation_id: &str) -> Result<&Conversation> {
        self.conversations
            .get(conversation_id)
            .ok_or_else(|| CoreError::ConversationNotFound(conversation_id.to_string()))
    }

    fn require_mut(&mut self, conversation_id: &str) -> Result<&mut Conversation> {
        self.conversations
            .get_mut(conversation_id)
            .ok_or_else(|| CoreError::ConversationNotFound(conversation_id.to_string()))
    }

    fn slug_taken(&self, slug: &str, exclude_id: &str) -> bool {
        self.conversations
            .values()
            .any(|c| c.conversation_id != exclude_id && c.slug.as_deref() == Some(slug))
    }

    fn select(
        &self,
        archived: bool,
        query: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Vec<Conversation> {
        let mut rows: Vec<Conversation> = self
            .conversations
            .values()
            .filter(|c| c.archived == archived)
            .filter(|c| match query {
                Some(q) => c.slug.as_deref().is_some_and(|s| s.contains(q)),
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        rows.into_iter().skip(offset).take(limit).collect()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(
        &self,
        slug: Option<String>,
        cwd: Option<String>,
    ) -> Result<Conversation> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slug) = slug.as_deref() {
            if inner.slug_taken(slug, "") {
                return Err(CoreError::SlugConflict(slug.to_string()));
            }
        }
        let now = Utc::now();
        let conversation = Conversation {
            conversation_id: Uuid::new_v4().to_string(),
            slug,
            created_at: now,
            updated_at: now,
            archived: false,
            cwd,
            model_id: None,
        };
        inner
            .conversations
            .insert(conversation.conversation_id.clone(), conversation.clone());
        inner
            .messages
            .insert(conversation.conversation_id.clone(), Vec::new());
        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        let inner = self.inner.lock().unwrap();
        inner.require(conversation_id).cloned()
    }

    async fn get_conversation_by_slug(&self, slug: &str) -> Result<Conversation> {
        let inner = self.inner.lock().unwrap();
        inner
            .conversations
            .values()
            .find(|c| c.slug.as_deref() == Some(slug))
            .cloned()
            .ok_or_else(|| CoreError::ConversationNotFound(format!("slug:{slug}")))
    }

    async fn list_conversations(&self, limit: usize, offset: usize) -> Result<Vec<Conversation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.select(false, None, limit, offset))
    }

    async fn search_conversations(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Conversation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.select(false, Some(query), limit, offset))
    }

    async fn list_archived(&self, limit: usize, offset: usize) -> Result<Vec<Conversation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.select(true, None, limit, offset))
    }

    async fn search_archived(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Conversation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.select(true, Some(query), limit, offset))
    }

    async fn count_conversations(&self) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.conversations.len())
    }

    async fn update_slug(&self, conversation_id: &str, slug: &str) -> Result<Conversation> {
        let mut inner = self.inner.lock().unwrap();
        if inner.slug_taken(slug, conversation_id) {
            return Err(CoreError::SlugConflict(slug.to_string()));
        }
        let conversation = inner.require_mut(conversation_id)?;
        conversation.slug = Some(slug.to_string());
        Ok(conversation.clone())
    }

    async fn archive(&self, conversation_id: &str) -> Result<Conversation> {
        let mut inner = self.inner.lock().unwrap();
        let conversation = inner.require_mut(conversation_id)?;
        conversation.archived = true;
        Ok(conversation.clone())
    }

    async fn unarchive(&self, conversation_id: &str) -> Result<Conversation> {
        let mut inner = self.inner.lock().unwrap();
        let conversation = inner.require_mut(conversation_id)?;
        conversation.archived = false;
        Ok(conversation.clone())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require(conversation_id)?;
        inner.conversations.remove(conversation_id);
        inner.messages.remove(conversation_id);
        Ok(())
    }

    async fn update_cwd(&self, conversation_id: &str, cwd: &str) -> Result<Conversation> {
        let mut inner = self.inner.lock().unwrap();
        let conversation = inner.require_mut(conversation_id)?;
        conversation.cwd = Some(cwd.to_string());
        Ok(conversation.clone())
    }

    async fn set_model_id(&self, conversation_id: &str, model_id: &str) -> Result<Conversation> {
        let mut inner = self.inner.lock().unwrap();
        let conversation = inner.require_mut(conversation_id)?;
        conversation.model_id = Some(model_id.to_string());
        Ok(conversation.clone())
    }

    async fn append_message(&self, params: AppendMessage) -> Result<StoredMessage> {
        let mut inner = self.inner.lock().unwrap();
        inner.require(&params.conversation_id)?;
        let now = Utc::now();
        let journal = inner
            .messages
            .get_mut(&params.conversation_id)
            .expect("journal exists for every conversation row");
        let message = StoredMessage {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: params.conversation_id.clone(),
            sequence_id: journal.len() as i64,
            kind: params.kind,
            llm_data: params.llm_data,
            user_data: params.user_data,
            usage_data: params.usage_data,
            display_data: params.display_data,
            created_at: now,
        };
        journal.push(message.clone());
        let conversation = inner
            .require_mut(&params.conversation_id)
            .expect("conversation row checked above");
        conversation.updated_at = now;
        Ok(message)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let inner = self.inner.lock().unwrap();
        inner.require(conversation_id)?;
        Ok(inner
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_message(&self, conversation_id: &str) -> Result<Option<StoredMessage>> {
        let inner = self.inner.lock().unwrap();
        inner.require(conversation_id)?;
        Ok(inner
            .messages
            .get(conversation_id)
            .and_then(|journal| journal.last().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn force_updated_at(store: &MemoryStore, conversation_id: &str, ts: DateTime<Utc>) {
        let mut inner = store.inner.lock().unwrap();
        inner
            .conversations
            .get_mut(conversation_id)
            .unwrap()
            .updated_at = ts;
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn append_assigns_dense_sequence_ids() {
        let store = MemoryStore::new();
        let conv = store.create_conversation(None, None).await.unwrap();

        for _ in 0..5 {
            store
                .append_message(
                    AppendMessage::new(&conv.conversation_id, MessageKind::User)
                        .with_llm_data(llm::Message::user("hi")),
                )
                .await
                .unwrap();
        }

        let messages = store.list_messages(&conv.conversation_id).await.unwrap();
        let sequence: Vec<i64> = messages.iter().map(|m| m.sequence_id).collect();
        assert_eq!(sequence, vec![0, 1, 2, 3, 4]);

        let ids: std::collections::HashSet<_> =
            messages.iter().map(|m| m.message_id.clone()).collect();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn append_bumps_updated_at() {
        let store = MemoryStore::new();
        let conv = store.create_conversation(None, None).await.unwrap();
        force_updated_at(&store, &conv.conversation_id, at(8));

        store
            .append_message(AppendMessage::new(&conv.conversation_id, MessageKind::User))
            .await
            .unwrap();

        let after = store.get_conversation(&conv.conversation_id).await.unwrap();
        assert!(after.updated_at > at(8));
    }

    #[tokio::test]
    async fn multiple_null_slugs_coexist() {
        let store = MemoryStore::new();
        let a = store.create_conversation(None, None).await.unwrap();
        let b = store.create_conversation(None, None).await.unwrap();
        assert!(a.slug.is_none());
        assert!(b.slug.is_none());
        assert_ne!(a.conversation_id, b.conversation_id);
    }

    #[tokio::test]
    async fn non_null_slug_must_be_unique() {
        let store = MemoryStore::new();
        store
            .create_conversation(Some("unique-slug".to_string()), None)
            .await
            .unwrap();
        let err = store
            .create_conversation(Some("unique-slug".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SlugConflict(_)));
    }

    #[tokio::test]
    async fn update_slug_conflicts_and_leaves_updated_at_alone() {
        let store = MemoryStore::new();
        let a = store
            .create_conversation(Some("taken".to_string()), None)
            .await
            .unwrap();
        let b = store.create_conversation(None, None).await.unwrap();
        force_updated_at(&store, &b.conversation_id, at(9));

        let err = store
            .update_slug(&b.conversation_id, "taken")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SlugConflict(_)));

        let renamed = store.update_slug(&b.conversation_id, "free").await.unwrap();
        assert_eq!(renamed.slug.as_deref(), Some("free"));
        assert_eq!(renamed.updated_at, at(9));

        // A conversation may keep (re-set) its own slug.
        store.update_slug(&a.conversation_id, "taken").await.unwrap();
    }

    #[tokio::test]
    async fn archive_order_follows_activity_not_archive_time() {
        let store = MemoryStore::new();
        let a = store.create_conversation(Some("a".into()), None).await.unwrap();
        let b = store.create_conversation(Some("b".into()), None).await.unwrap();
        let c = store.create_conversation(Some("c".into()), None).await.unwrap();

        force_updated_at(&store, &a.conversation_id, at(10));
        force_updated_at(&store, &b.conversation_id, at(14));
        force_updated_at(&store, &c.conversation_id, at(12));

        // Archive in a different order than activity: C, B, A.
        store.archive(&c.conversation_id).await.unwrap();
        store.archive(&b.conversation_id).await.unwrap();
        store.archive(&a.conversation_id).await.unwrap();

        let archived = store.list_archived(10, 0).await.unwrap();
        let order: Vec<&str> = archived
            .iter()
            .map(|conv| conv.conversation_id.as_str())
            .collect();
        assert_eq!(
            order,
            vec![
                b.conversation_id.as_str(),
                c.conversation_id.as_str(),
                a.conversation_id.as_str()
            ]
        );

        // Archiving never moved the activity timestamps.
        assert_eq!(archived[0].updated_at, at(14));
        assert_eq!(archived[1].updated_at, at(12));
        assert_eq!(archived[2].updated_at, at(10));
    }

    #[tokio::test]
    async fn unarchive_preserves_sort_position() {
        let store = MemoryStore::new();
        let old = store.create_conversation(Some("old".into()), None).await.unwrap();
        let mid = store.create_conversation(Some("mid".into()), None).await.unwrap();
        let new = store.create_conversation(Some("new".into()), None).await.unwrap();

        force_updated_at(&store, &old.conversation_id, at(8));
        force_updated_at(&store, &mid.conversation_id, at(12));
        force_updated_at(&store, &new.conversation_id, at(16));

        store.archive(&mid.conversation_id).await.unwrap();
        store.unarchive(&mid.conversation_id).await.unwrap();

        let listed = store.list_conversations(10, 0).await.unwrap();
        let order: Vec<&str> = listed
            .iter()
            .map(|conv| conv.conversation_id.as_str())
            .collect();
        assert_eq!(
            order,
            vec![
                new.conversation_id.as_str(),
                mid.conversation_id.as_str(),
                old.conversation_id.as_str()
            ]
        );
    }

    #[tokio::test]
    async fn search_matches_slug_substring() {
        let store = MemoryStore::new();
        for slug in ["project-alpha", "project-beta", "work-task", "personal-note"] {
            store
                .create_conversation(Some(slug.to_string()), None)
                .await
                .unwrap();
        }

        let results = store.search_conversations("project", 10, 0).await.unwrap();
        assert_eq!(results.len(), 2);
        for conv in results {
            assert!(conv.slug.unwrap().contains("project"));
        }
    }

    #[tokio::test]
    async fn delete_removes_conversation_and_journal() {
        let store = MemoryStore::new();
        let conv = store.create_conversation(None, None).await.unwrap();
        store
            .append_message(AppendMessage::new(&conv.conversation_id, MessageKind::User))
            .await
            .unwrap();

        store.delete_conversation(&conv.conversation_id).await.unwrap();
        assert!(store.get_conversation(&conv.conversation_id).await.is_err());
        assert!(store.list_messages(&conv.conversation_id).await.is_err());
    }

    #[tokio::test]
    async fn lookup_by_slug() {
        let store = MemoryStore::new();
        let created = store
            .create_conversation(Some("find-me".to_string()), None)
            .await
            .unwrap();

        let found = store.get_conversation_by_slug("find-me").await.unwrap();
        assert_eq!(found.conversation_id, created.conversation_id);
        assert!(store.get_conversation_by_slug("missing").await.is_err());
    }

    #[tokio::test]
    async fn model_id_and_cwd_updates() {
        let store = MemoryStore::new();
        let conv = store.create_conversation(None, None).await.unwrap();

        let with_model = store
            .set_model_id(&conv.conversation_id, "predictable")
            .await
            .unwrap();
        assert_eq!(with_model.model_id.as_deref(), Some("predictable"));

        let with_cwd = store
            .update_cwd(&conv.conversation_id, "/tmp/project")
            .await
            .unwrap();
        assert_eq!(with_cwd.cwd.as_deref(), Some("/tmp/project"));
    }

    #[tokio::test]
    async fn latest_message_returns_tail() {
        let store = MemoryStore::new();
        let conv = store.create_conversation(None, None).await.unwrap();
        assert!(store
            .latest_message(&conv.conversation_id)
            .await
            .unwrap()
            .is_none());

        store
            .append_message(AppendMessage::new(&conv.conversation_id, MessageKind::User))
            .await
            .unwrap();
        store
            .append_message(AppendMessage::new(&conv.conversation_id, MessageKind::Agent))
            .await
            .unwrap();

        let tail = store
            .latest_message(&conv.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tail.sequence_id, 1);
        assert_eq!(tail.kind, MessageKind::Agent);
    }
}
