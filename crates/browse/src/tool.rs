//! Tool façades over the browser runtime
//!
//! A single combined `browser` tool dispatches on an `action` string to
//! the runtime's operations; `read_image` is exposed separately. Bad
//! input and unknown actions come back as recoverable tool errors for
//! the model, never as transport failures.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use confab_core::tools::{Tool, ToolContext, ToolOut};

use crate::runtime::BrowseRuntime;

const BROWSER_DESCRIPTION: &str = r#"Browser automation tool. Use the "action" field to select an operation:

- action: "navigate"
  Navigate the browser to a specific URL and wait for page to load.
  Parameters: url (string, required), timeout (string, optional)

- action: "eval"
  Evaluate JavaScript in the browser context. Your go-to for interacting with content: clicking buttons, typing, getting content, scrolling, waiting for content/selector to be ready, etc.
  Parameters: expression (string, required), timeout (string, optional), await (boolean, default true)

- action: "resize"
  Resize the browser viewport to a specific width and height.
  Parameters: width (integer, required), height (integer, required), timeout (string, optional)

- action: "screenshot"
  Take a screenshot of the page or a specific element.
  Parameters: selector (string, optional), timeout (string, optional)

- action: "console_logs"
  Get recent browser console logs.
  Parameters: limit (integer, optional, default 100)

- action: "clear_console_logs"
  Clear all captured browser console logs.
  No additional parameters."#;

/// The combined browser tool.
pub struct BrowserTool {
    runtime: Arc<BrowseRuntime>,
}

impl BrowserTool {
    pub fn new(runtime: Arc<BrowseRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Tool for BrowserTool {
    fn name(&self) -> &str {
        "browser"
    }

    fn description(&self) -> &str {
        BROWSER_DESCRIPTION
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "description": "The browser action to perform",
                    "enum": ["navigate", "eval", "resize", "screenshot", "console_logs", "clear_console_logs"]
                },
                "url": {
                    "type": "string",
                    "description": "URL to navigate to (navigate action)"
                },
                "expression": {
                    "type": "string",
                    "description": "JavaScript expression to evaluate (eval action)"
                },
                "await": {
                    "type": "boolean",
                    "description": "Wait for promises to resolve (eval action, default true)"
                },
                "width": {
                    "type": "integer",
                    "description": "Viewport width in pixels (resize action)"
                },
                "height": {
                    "type": "integer",
                    "description": "Viewport height in pixels (resize action)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Max log entries to return (console_logs action, default 100)"
                },
                "selector": {
                    "type": "string",
                    "description": "CSS selector for element to screenshot (screenshot action)"
                },
                "timeout": {
                    "type": "string",
                    "description": "Timeout as a duration string (default: 15s)"
                }
            },
            "required": ["action"]
        })
    }

    async fn run(&self, _ctx: &ToolContext, input: Value) -> ToolOut {
        let action = input
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        macro_rules! parse {
            ($ty:ty) => {
                match serde_json::from_value::<$ty>(input.clone()) {
                    Ok(parsed) => parsed,
                    Err(e) => return ToolOut::error(format!("invalid input: {e}")),
                }
            };
        }

        match action.as_str() {
            "navigate" => self.runtime.navigate(parse!(crate::runtime::NavigateInput)).await,
            "eval" => self.runtime.eval(parse!(crate::runtime::EvalInput)).await,
            "resize" => self.runtime.resize(parse!(crate::runtime::ResizeInput)).await,
            "screenshot" => {
                self.runtime
                    .screenshot(parse!(crate::runtime::ScreenshotInput))
                    .await
            }
            "console_logs" => {
                self.runtime
                    .console_logs(parse!(crate::runtime::ConsoleLogsInput))
                    .await
            }
            "clear_console_logs" => self.runtime.clear_console_logs().await,
            other => ToolOut::error(format!("unknown action: {other:?}")),
        }
    }
}

/// Standalone tool for reading image files from disk.
pub struct ReadImageTool {
    runtime: Arc<BrowseRuntime>,
}

impl ReadImageTool {
    pub fn new(runtime: Arc<BrowseRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Tool for ReadImageTool {
    fn name(&self) -> &str {
        "read_image"
    }

    fn description(&self) -> &str {
        "Read an image file (such as a screenshot) and encode it for sending to the LLM"
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the image file to read"
                },
                "timeout": {
                    "type": "string",
                    "description": "Timeout as a duration string (default: 15s)"
                }
            },
            "required": ["path"]
        })
    }

    async fn run(&self, _ctx: &ToolContext, input: Value) -> ToolOut {
        let input = match serde_json::from_value::<crate::runtime::ReadImageInput>(input) {
            Ok(input) => input,
            Err(e) => return ToolOut::error(format!("invalid input: {e}")),
        };
        self.runtime.read_image(input).await
    }
}
