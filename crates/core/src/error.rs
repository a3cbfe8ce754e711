//! Error types for confab-core

use thiserror::Error;

/// Errors that can occur in the conversation core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Conversation lookup failure
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// Non-NULL slug uniqueness violation
    #[error("slug already in use: {0}")]
    SlugConflict(String),

    /// A later turn asked for a different model than the sticky first-turn model
    #[error("conversation model mismatch: conversation uses '{existing}', request asked for '{requested}'")]
    ModelMismatch { existing: String, requested: String },

    /// A user message arrived while a turn was still running
    #[error("a turn is already in progress for conversation {0}")]
    TurnInProgress(String),

    /// No LLM service is available under the given model id
    #[error("no service available for model: {0}")]
    NoSuchModel(String),

    /// Slug generation failure (empty candidate, exhausted retries, no model)
    #[error("{0}")]
    Slug(String),

    /// Storage backend failure other than a constraint violation
    #[error("store error: {0}")]
    Store(String),

    /// Serialization/deserialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
