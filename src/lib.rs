//! Chat History Manager
//!
//! Session-keyed conversation history for language-model applications:
//! - Ordered messages per session, cached in-process
//! - Interchangeable persistence (memory, JSON files, SQLite, Postgres)
//! - Memory strategies that keep a conversation within budget
//!   (trimming, incremental anchor-based summarization)
//! - Per-session serialization of every read-modify-write
//!
//! FLOW:
//! ADD → LOAD (on miss) → APPEND → MANAGE → SAVE

pub mod config;
pub mod error;
pub mod locks;
pub mod manager;
pub mod message;
pub mod store;
pub mod strategy;
pub mod summarizer;
pub mod tokens;

pub use error::{HistoryError, Result};

// Re-export common types
pub use config::{BackendKind, HistoryConfig};
pub use manager::ChatHistoryManager;
pub use message::{ContextMessage, Message, Metadata, Role, SessionStats};
pub use store::{
    ChatHistoryStore, InMemoryStore, JsonFileStore, LoadPolicy, PostgresStore, SqliteStore,
};
pub use strategy::{
    MemoryStrategy, SummarizationConfig, SummarizationStrategy, TrimmingConfig, TrimmingStrategy,
};
pub use summarizer::{LanguageModel, LlmSummarizer, Summarizer};
pub use tokens::TokenCounter;
