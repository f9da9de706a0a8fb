//! Error types for the chat history engine

use thiserror::Error;

/// Result type alias for history operations
pub type Result<T> = std::result::Result<T, HistoryError>;

#[derive(Error, Debug)]
pub enum HistoryError {

    // =============================
    // Persistence Errors
    // =============================

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Corrupt history for session {session_id}: {reason}")]
    CorruptHistory { session_id: String, reason: String },

    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("Message {message_id} already exists in session {session_id}")]
    DuplicateMessageId {
        session_id: String,
        message_id: String,
    },

    // =============================
    // Strategy / Configuration Errors
    // =============================

    #[error("Summarization error: {0}")]
    SummarizationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl HistoryError {
    pub(crate) fn corrupt(session_id: &str, reason: impl std::fmt::Display) -> Self {
        Self::CorruptHistory {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        }
    }
}
