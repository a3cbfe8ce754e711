//! Provider-neutral LLM types and service traits
//!
//! Real providers (Anthropic, OpenAI, gateways) live behind
//! [`LlmService`]; this crate only depends on the shapes that flow
//! through the conversation log and the turn loop. Retry and backoff are
//! the service's responsibility — the turn loop never retries a model
//! call.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// One part of a tool result: text, or inline media for the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultContent {
    Text { text: String },
    Media { media_type: String, data: String },
}

impl ToolResultContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Message content blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    /// Reasoning content from thinking-capable models. Skipped when
    /// extracting plain text (e.g. for slug candidates).
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ToolResultContent>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display: Option<serde_json::Value>,
    },
}

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// A single message in a conversation, as sent to and received from
/// model providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Content>,
    /// Set by the model on assistant messages when it considers the turn
    /// finished.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end_of_turn: bool,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![Content::Text { text: text.into() }],
            end_of_turn: false,
        }
    }

    pub fn assistant(text: impl Into<String>, end_of_turn: bool) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![Content::Text { text: text.into() }],
            end_of_turn,
        }
    }

    /// Concatenated plain text content (thinking blocks excluded).
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool-use blocks of this message.
    pub fn tool_uses(&self) -> Vec<ToolUse> {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::ToolUse {
                    id,
                    tool_name,
                    input,
                } => Some(ToolUse {
                    id: id.clone(),
                    tool_name: tool_name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, Content::ToolUse { .. }))
    }

    pub fn has_tool_result(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, Content::ToolResult { .. }))
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolUse {
    pub id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
}

/// Token accounting for one model call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    /// Full context window the next turn would carry: all input tokens
    /// (regular plus cached, read and created) plus output tokens.
    pub fn context_window_used(&self) -> u64 {
        self.input_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
            + self.output_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.context_window_used() == 0
    }
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

/// A completion response: an assistant message plus usage accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub message: Message,
    #[serde(default)]
    pub usage: Usage,
}

/// An LLM completion service for a single model.
///
/// `complete` may block for minutes; it must observe `cancel` promptly.
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn complete(&self, cancel: &CancellationToken, request: Request) -> Result<Response>;
}

/// Metadata about an available model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    /// Comma-separated tag list (e.g. `"slug,cheap"`), used by the slug
    /// allocator's fallback chain.
    #[serde(default)]
    pub tags: String,
}

/// A catalog of LLM services keyed by model id.
pub trait LlmProvider: Send + Sync {
    fn get_service(&self, model_id: &str) -> crate::Result<Arc<dyn LlmService>>;
    fn available_models(&self) -> Vec<String>;
    fn model_info(&self, model_id: &str) -> Option<ModelInfo>;
    fn has_model(&self, model_id: &str) -> bool {
        self.get_service(model_id).is_ok()
    }
}

// ============================================================================
// Model registry
// ============================================================================

/// In-process [`LlmProvider`] backed by a registration map. The server
/// wires configured services in at startup; tests register scripted ones.
#[derive(Default)]
pub struct ModelRegistry {
    models: Mutex<Vec<(ModelInfo, Arc<dyn LlmService>)>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        model_id: impl Into<String>,
        tags: impl Into<String>,
        service: Arc<dyn LlmService>,
    ) {
        let info = ModelInfo {
            id: model_id.into(),
            tags: tags.into(),
        };
        let mut models = self.models.lock().unwrap();
        models.retain(|(existing, _)| existing.id != info.id);
        models.push((info, service));
    }
}

impl LlmProvider for ModelRegistry {
    fn get_service(&self, model_id: &str) -> crate::Result<Arc<dyn LlmService>> {
        let models = self.models.lock().unwrap();
        models
            .iter()
            .find(|(info, _)| info.id == model_id)
            .map(|(_, service)| service.clone())
            .ok_or_else(|| crate::CoreError::NoSuchModel(model_id.to_string()))
    }

    fn available_models(&self) -> Vec<String> {
        let models = self.models.lock().unwrap();
        models.iter().map(|(info, _)| info.id.clone()).collect()
    }

    fn model_info(&self, model_id: &str) -> Option<ModelInfo> {
        let models = self.models.lock().unwrap();
        models
            .iter()
            .find(|(info, _)| info.id == model_id)
            .map(|(info, _)| info.clone())
    }
}

// ============================================================================
// Predictable service
// ============================================================================

/// Model id of the deterministic testing model.
pub const PREDICTABLE_MODEL_ID: &str = "predictable";

/// Deterministic [`LlmService`] used in tests and offline development.
///
/// Scripted responses are returned in push order; with the script empty
/// it answers with a short end-of-turn echo of the last user text.
#[derive(Default)]
pub struct PredictableService {
    script: Mutex<VecDeque<Response>>,
}

impl PredictableService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Response) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push_response(Response {
            message: Message::assistant(text, true),
            usage: Usage::default(),
        });
    }
}

#[async_trait]
impl LlmService for PredictableService {
    async fn complete(&self, cancel: &CancellationToken, request: Request) -> Result<Response> {
        if cancel.is_cancelled() {
            anyhow::bail!("request cancelled");
        }
        if let Some(response) = self.script.lock().unwrap().pop_front() {
            return Ok(response);
        }
        let last_user_text = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_default();
        let echo: String = last_user_text.chars().take(40).collect();
        Ok(Response {
            message: Message::assistant(format!("ok: {echo}"), true),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_skips_thinking_and_tool_blocks() {
        let message = Message {
            role: Role::Assistant,
            content: vec![
                Content::Thinking {
                    thinking: "hmm".to_string(),
                },
                Content::Text {
                    text: "hello".to_string(),
                },
                Content::ToolUse {
                    id: "tu_1".to_string(),
                    tool_name: "browser".to_string(),
                    input: serde_json::json!({}),
                },
            ],
            end_of_turn: false,
        };
        assert_eq!(message.text(), "hello");
        assert_eq!(message.tool_uses().len(), 1);
        assert!(message.has_tool_use());
    }

    #[test]
    fn context_window_sums_all_input_and_output() {
        let usage = Usage {
            input_tokens: 100,
            output_tokens: 20,
            cache_read_input_tokens: 300,
            cache_creation_input_tokens: 50,
        };
        assert_eq!(usage.context_window_used(), 470);
        assert!(!usage.is_zero());
        assert!(Usage::default().is_zero());
    }

    #[test]
    fn message_serde_round_trip() {
        let message = Message {
            role: Role::Tool,
            content: vec![Content::ToolResult {
                tool_use_id: "tu_1".to_string(),
                content: vec![ToolResultContent::text("done")],
                is_error: false,
                display: None,
            }],
            end_of_turn: false,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("tool_result"));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert!(back.has_tool_result());
    }

    #[tokio::test]
    async fn predictable_service_plays_script_then_echoes() {
        let service = PredictableService::new();
        service.push_text("scripted");

        let cancel = CancellationToken::new();
        let request = Request {
            messages: vec![Message::user("what is up")],
            ..Default::default()
        };

        let first = service.complete(&cancel, request.clone()).await.unwrap();
        assert_eq!(first.message.text(), "scripted");

        let second = service.complete(&cancel, request).await.unwrap();
        assert!(second.message.text().starts_with("ok: what is up"));
        assert!(second.message.end_of_turn);
    }

    #[test]
    fn registry_replaces_on_reregister_and_reports_tags() {
        let registry = ModelRegistry::new();
        registry.register("m1", "slug", Arc::new(PredictableService::new()));
        registry.register("m1", "slug,cheap", Arc::new(PredictableService::new()));

        assert_eq!(registry.available_models(), vec!["m1".to_string()]);
        assert_eq!(registry.model_info("m1").unwrap().tags, "slug,cheap");
        assert!(registry.get_service("missing").is_err());
    }
}
