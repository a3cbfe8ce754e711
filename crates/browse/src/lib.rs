//! # confab-browse
//!
//! Browser automation tools backed by a single shared Chromium process.
//!
//! The browser is a lazily-started shared resource: the first action
//! launches it, every successful action re-arms an idle timer that
//! shuts it down after 30 minutes of silence, and a crashed process is
//! detected on the next demand and replaced. Console output and
//! download lifecycle events are intercepted so tools can report them
//! to the model.
//!
//! Two tools are exposed through [`tool`]: a combined `browser` tool
//! that dispatches on an `action` field (navigate, eval, resize,
//! screenshot, console_logs, clear_console_logs) and a standalone
//! `read_image` tool.

pub mod cdp;
pub mod error;
pub mod imageutil;
pub mod runtime;
pub mod tool;

pub use error::{BrowseError, Result};
pub use runtime::{BrowseConfig, BrowseRuntime, DownloadRecord};
pub use tool::{BrowserTool, ReadImageTool};
