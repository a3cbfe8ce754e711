//! The tool system
//!
//! A uniform surface over heterogeneous tools: each tool declares a
//! name, description, and JSON input schema, and produces a [`ToolOut`]
//! that either carries content for the model or an error flag. Tool
//! errors are recoverable values routed back to the model as
//! tool-result errors — never a server fault, never a panic.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::{ToolDefinition, ToolResultContent};

/// Execution context handed to every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    /// Working directory associated with the conversation, if any.
    pub cwd: Option<String>,
    /// The per-turn cancel token; tools must observe it promptly.
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            cwd: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cwd(mut self, cwd: Option<String>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Tool output: ordered content parts for the model, an optional UI
/// display record, and an error flag.
#[derive(Debug, Clone, Default)]
pub struct ToolOut {
    pub content: Vec<ToolResultContent>,
    pub display: Option<serde_json::Value>,
    pub is_error: bool,
}

impl ToolOut {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::text(text)],
            display: None,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::text(message)],
            display: None,
            is_error: true,
        }
    }

    pub fn with_display(mut self, display: serde_json::Value) -> Self {
        self.display = Some(display);
        self
    }

    /// Concatenated text parts, mostly useful in tests.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolResultContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// The core tool abstraction.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name, unique within a registry.
    fn name(&self) -> &str;

    /// Human-readable description for the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool input.
    fn schema(&self) -> serde_json::Value;

    /// Run the tool. Failures are reported through the returned
    /// [`ToolOut`]'s error flag, not as transport errors.
    async fn run(&self, ctx: &ToolContext, input: serde_json::Value) -> ToolOut;
}

/// Registry of available tools.
///
/// Registration order is preserved so tool schemas reach the model in a
/// stable order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<Vec<Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any existing tool of the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write().unwrap();
        tools.retain(|existing| existing.name() != tool.name());
        tracing::debug!(tool = tool.name(), "registering tool");
        tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().unwrap();
        tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().unwrap().is_empty()
    }

    /// Tool definitions advertised to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().unwrap();
        tools
            .iter()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.schema(),
            })
            .collect()
    }

    /// Run a tool by name. An unknown name is a recoverable error
    /// result for the model, not a fault.
    pub async fn run(&self, ctx: &ToolContext, name: &str, input: serde_json::Value) -> ToolOut {
        let Some(tool) = self.get(name) else {
            return ToolOut::error(format!("unknown tool: {name}"));
        };
        tool.run(ctx, input).await
    }
}
