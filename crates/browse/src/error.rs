//! Error types for confab-browse

use thiserror::Error;

/// Errors from the browser runtime and its protocol plumbing
#[derive(Debug, Error)]
pub enum BrowseError {
    /// The browser process could not be launched
    #[error("failed to start browser (please install chromium or equivalent): {0}")]
    Start(String),

    /// The DevTools connection died or the process exited
    #[error("browser connection closed: {0}")]
    ConnectionClosed(String),

    /// A DevTools command failed
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An action exceeded its timeout
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Filesystem failure (screenshots, downloads, spill files)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for browser operations
pub type Result<T> = std::result::Result<T, BrowseError>;
