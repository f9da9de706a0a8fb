//! History persistence layer
//!
//! `ChatHistoryStore` is the durable source of truth for session
//! histories. Backends: in-memory, JSON file per session, SQLite and
//! Postgres. Every backend decodes records under the same `LoadPolicy`.

pub mod json;
pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use json::JsonFileStore;
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use crate::config::{BackendKind, HistoryConfig};
use crate::error::HistoryError;
use crate::message::{Message, Metadata};
use crate::Result;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Trait for chat history persistence
#[async_trait::async_trait]
pub trait ChatHistoryStore: Send + Sync {
    /// Load a session's messages in insertion order. Unknown sessions
    /// yield an empty list.
    async fn load_history(&self, session_id: &str) -> Result<Vec<Message>>;

    /// Atomically replace the session's persisted messages with `messages`.
    async fn save_history(&self, session_id: &str, messages: &[Message]) -> Result<()>;

    /// Add one message to the end of the session.
    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()>;

    /// Delete everything stored for the session. Idempotent.
    async fn clear_history(&self, session_id: &str) -> Result<()>;

    /// Sessions that have any persisted state.
    async fn list_sessions(&self) -> Result<BTreeSet<String>>;
}

/// What to do with a persisted record that cannot be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    /// Fail the whole load with `CorruptHistory`
    #[default]
    FailFast,
    /// Log a warning, drop the record and keep going
    SkipCorrupt,
}

impl FromStr for LoadPolicy {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fail_fast" | "fail-fast" => Ok(LoadPolicy::FailFast),
            "skip_corrupt" | "skip-corrupt" => Ok(LoadPolicy::SkipCorrupt),
            other => Err(HistoryError::ConfigError(format!(
                "unknown load policy '{}' (expected fail_fast or skip_corrupt)",
                other
            ))),
        }
    }
}

impl LoadPolicy {
    /// Apply the policy to decoded records, then normalize survivors:
    /// the owning session is stamped on and blank ids are regenerated.
    pub(crate) fn collect<I>(self, session_id: &str, records: I) -> Result<Vec<Message>>
    where
        I: IntoIterator<Item = std::result::Result<Message, String>>,
    {
        let mut messages = Vec::new();

        for (position, record) in records.into_iter().enumerate() {
            match record {
                Ok(mut message) => {
                    message.session_id = Some(session_id.to_string());
                    message.ensure_message_id();
                    messages.push(message);
                }
                Err(reason) => match self {
                    LoadPolicy::FailFast => {
                        return Err(HistoryError::corrupt(
                            session_id,
                            format!("record {}: {}", position, reason),
                        ));
                    }
                    LoadPolicy::SkipCorrupt => {
                        warn!(
                            session_id = %session_id,
                            position,
                            "Skipping corrupt history record: {}",
                            reason
                        );
                    }
                },
            }
        }

        Ok(messages)
    }
}

/// Decode the serialized metadata column. NULL or blank means empty.
pub(crate) fn decode_metadata(raw: Option<&str>) -> std::result::Result<Metadata, String> {
    match raw.map(str::trim) {
        None | Some("") | Some("null") => Ok(Metadata::new()),
        Some(text) => serde_json::from_str::<Metadata>(text)
            .map_err(|e| format!("invalid metadata: {}", e)),
    }
}

/// Build the store selected by `config`
pub async fn build_store(config: &HistoryConfig) -> Result<Arc<dyn ChatHistoryStore>> {
    let store: Arc<dyn ChatHistoryStore> = match &config.backend {
        BackendKind::Memory => Arc::new(InMemoryStore::new()),
        BackendKind::Json { dir } => {
            Arc::new(JsonFileStore::open(dir, config.load_policy).await?)
        }
        BackendKind::Sqlite { path } => Arc::new(
            SqliteStore::open(path, config.max_connections, config.load_policy).await?,
        ),
        BackendKind::Postgres { url } => Arc::new(PostgresStore::connect_lazy(
            url,
            config.max_connections,
            config.load_policy,
        )?),
    };

    info!("Chat history backend: {}", config.backend.name());
    Ok(store)
}
