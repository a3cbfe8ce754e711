//! Streaming snapshot types
//!
//! The value type carried on each conversation's subscription bus, and
//! the helpers that derive the observable turn state from a message
//! list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm;
use crate::store::{Conversation, MessageKind, StoredMessage};

/// The message format sent to streaming clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub sequence_id: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_data: Option<llm::Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_data: Option<llm::Usage>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_data: Option<serde_json::Value>,
    /// Derived from `llm_data` for agent entries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_of_turn: Option<bool>,
}

impl From<StoredMessage> for ApiMessage {
    fn from(msg: StoredMessage) -> Self {
        let end_of_turn = match (msg.kind, &msg.llm_data) {
            (MessageKind::Agent, Some(data)) => Some(data.end_of_turn),
            _ => None,
        };
        Self {
            message_id: msg.message_id,
            conversation_id: msg.conversation_id,
            sequence_id: msg.sequence_id,
            kind: msg.kind,
            llm_data: msg.llm_data,
            user_data: msg.user_data,
            usage_data: msg.usage_data,
            created_at: msg.created_at,
            display_data: msg.display_data,
            end_of_turn,
        }
    }
}

/// An update to the conversation list, broadcast to every stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationListUpdate {
    /// `"update"` or `"delete"`.
    #[serde(rename = "type")]
    pub update_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
    /// Set for deletes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub conversation_id: String,
}

impl ConversationListUpdate {
    pub fn update(conversation: Conversation) -> Self {
        Self {
            update_type: "update".to_string(),
            conversation: Some(conversation),
            conversation_id: String::new(),
        }
    }

    pub fn delete(conversation_id: impl Into<String>) -> Self {
        Self {
            update_type: "delete".to_string(),
            conversation: None,
            conversation_id: conversation_id.into(),
        }
    }
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// The value published on a conversation's bus: usually one
/// newly-appended message plus the conversation snapshot and derived
/// turn state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamSnapshot {
    #[serde(default)]
    pub messages: Vec<ApiMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
    #[serde(default)]
    pub agent_working: bool,
    /// 0 is omitted so observers keep their previous value when an entry
    /// carries no usage accounting.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub context_window_size: u64,
    /// Set when another conversation in the list changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_list_update: Option<ConversationListUpdate>,
}

/// Whether the agent is still working, judged from the message list.
///
/// Trailing gitinfo entries are passive notifications and are skipped.
/// An error tail means not working; an agent tail reports its own
/// `end_of_turn` (absent flag counts as working). Any other tail over a
/// non-empty history means a turn is underway.
pub fn agent_working(messages: &[ApiMessage]) -> bool {
    if messages.is_empty() {
        return false;
    }

    let mut last_idx = messages.len() as i64 - 1;
    while last_idx >= 0 && messages[last_idx as usize].kind == MessageKind::GitInfo {
        last_idx -= 1;
    }
    if last_idx < 0 {
        return false;
    }
    let last = &messages[last_idx as usize];

    if last.kind == MessageKind::Error {
        return false;
    }

    if last.kind == MessageKind::Agent {
        return match last.end_of_turn {
            None => true,
            Some(end_of_turn) => !end_of_turn,
        };
    }

    // The tail is a user/tool entry: whatever the most recent agent
    // entry said, newer activity means the agent is working again.
    // No agent entry at all also counts as working.
    true
}

/// Whether a single stored message represents end of turn.
pub fn is_end_of_turn(msg: &StoredMessage) -> bool {
    match msg.kind {
        // Error messages end the turn.
        MessageKind::Error => true,
        // Gitinfo entries always come at end of turn.
        MessageKind::GitInfo => true,
        MessageKind::Agent => msg.llm_data.as_ref().is_some_and(|m| m.end_of_turn),
        _ => false,
    }
}

/// Context window usage from the most recent message carrying non-zero
/// usage. Each call's input tokens already represent the full history
/// sent to the model, so only the last accounted message matters.
pub fn context_window_size(messages: &[ApiMessage]) -> u64 {
    messages
        .iter()
        .rev()
        .filter_map(|m| m.usage_data.as_ref())
        .map(|usage| usage.context_window_used())
        .find(|used| *used != 0)
        .unwrap_or(0)
}

/// Context window usage from a single message; 0 (reported as omitted)
/// when the entry has no usage accounting, in which case observers keep
/// their previous value.
pub fn context_window_size_from(msg: &StoredMessage) -> u64 {
    msg.usage_data
        .map(|usage| usage.context_window_used())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_message(kind: MessageKind, end_of_turn: Option<bool>) -> ApiMessage {
        ApiMessage {
            message_id: String::new(),
            conversation_id: String::new(),
            sequence_id: 0,
            kind,
            llm_data: None,
            user_data: None,
            usage_data: None,
            created_at: Utc::now(),
            display_data: None,
            end_of_turn,
        }
    }

    #[test]
    fn agent_working_table() {
        use MessageKind::*;

        let cases: Vec<(&str, Vec<ApiMessage>, bool)> = vec![
            ("empty messages", vec![], false),
            (
                "agent with end_of_turn true",
                vec![api_message(Agent, Some(true))],
                false,
            ),
            (
                "agent with end_of_turn false",
                vec![api_message(Agent, Some(false))],
                true,
            ),
            (
                "agent with end_of_turn absent",
                vec![api_message(Agent, None)],
                true,
            ),
            ("error message", vec![api_message(Error, None)], false),
            (
                "agent end_of_turn then tool message means working",
                vec![api_message(Agent, Some(true)), api_message(Tool, None)],
                true,
            ),
            (
                "gitinfo after agent end_of_turn should NOT indicate working",
                vec![api_message(Agent, Some(true)), api_message(GitInfo, None)],
                false,
            ),
            (
                "multiple gitinfo after agent end_of_turn should NOT indicate working",
                vec![
                    api_message(Agent, Some(true)),
                    api_message(GitInfo, None),
                    api_message(GitInfo, None),
                ],
                false,
            ),
            (
                "gitinfo after agent not end_of_turn should indicate working",
                vec![api_message(Agent, Some(false)), api_message(GitInfo, None)],
                true,
            ),
            (
                "only gitinfo messages",
                vec![api_message(GitInfo, None), api_message(GitInfo, None)],
                false,
            ),
            (
                "user message with no agent reply yet",
                vec![api_message(User, None)],
                true,
            ),
        ];

        for (name, messages, want) in cases {
            assert_eq!(agent_working(&messages), want, "case: {name}");
        }
    }

    #[test]
    fn end_of_turn_derivation_from_stored_message() {
        let mut msg = StoredMessage {
            message_id: String::new(),
            conversation_id: String::new(),
            sequence_id: 0,
            kind: MessageKind::Agent,
            llm_data: Some(llm::Message::assistant("done", true)),
            user_data: None,
            usage_data: None,
            display_data: None,
            created_at: Utc::now(),
        };
        assert!(is_end_of_turn(&msg));

        msg.llm_data = Some(llm::Message::assistant("more to do", false));
        assert!(!is_end_of_turn(&msg));

        msg.kind = MessageKind::Error;
        assert!(is_end_of_turn(&msg));

        msg.kind = MessageKind::GitInfo;
        assert!(is_end_of_turn(&msg));

        msg.kind = MessageKind::User;
        assert!(!is_end_of_turn(&msg));
    }

    #[test]
    fn api_message_derives_end_of_turn_for_agent_entries_only() {
        let stored = StoredMessage {
            message_id: "m".to_string(),
            conversation_id: "c".to_string(),
            sequence_id: 3,
            kind: MessageKind::Agent,
            llm_data: Some(llm::Message::assistant("done", true)),
            user_data: None,
            usage_data: None,
            display_data: None,
            created_at: Utc::now(),
        };
        let api = ApiMessage::from(stored.clone());
        assert_eq!(api.end_of_turn, Some(true));

        let user = StoredMessage {
            kind: MessageKind::User,
            llm_data: Some(llm::Message::user("hello")),
            ..stored
        };
        assert_eq!(ApiMessage::from(user).end_of_turn, None);
    }

    #[test]
    fn context_window_takes_last_nonzero_usage() {
        let mut with_usage = api_message(MessageKind::Agent, Some(true));
        with_usage.usage_data = Some(llm::Usage {
            input_tokens: 1000,
            output_tokens: 100,
            ..Default::default()
        });
        let mut empty_usage = api_message(MessageKind::Tool, None);
        empty_usage.usage_data = Some(llm::Usage::default());
        let without = api_message(MessageKind::User, None);

        let messages = vec![with_usage, empty_usage, without];
        assert_eq!(context_window_size(&messages), 1100);
        assert_eq!(context_window_size(&[]), 0);
    }

    #[test]
    fn snapshot_serialization_omits_zero_context_window() {
        let snapshot = StreamSnapshot {
            agent_working: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("context_window_size"));

        let snapshot = StreamSnapshot {
            context_window_size: 42,
            ..Default::default()
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"context_window_size\":42"));
    }
}
