//! Embedded relational store (SQLite via sqlx)
//!
//! One row per message; insertion order is recovered from the
//! auto-increment `id`. Timestamps are stored as RFC 3339 text.

use crate::error::HistoryError;
use crate::message::{parse_timestamp, Message, Role};
use crate::store::{decode_metadata, ChatHistoryStore, LoadPolicy};
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

const INSERT_MESSAGE: &str = r#"
    INSERT INTO chat_messages
      (session_id, role, content, timestamp, metadata, message_id)
    VALUES
      (?, ?, ?, ?, ?, ?)
"#;

pub struct SqliteStore {
    pool: SqlitePool,
    load_policy: LoadPolicy,
}

impl SqliteStore {
    /// Open (creating if missing) the database file at `path`
    pub async fn open(
        path: impl AsRef<Path>,
        max_connections: u32,
        load_policy: LoadPolicy,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| {
                HistoryError::DatabaseError(format!(
                    "Failed to open SQLite database {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;

        info!("Initialized SQLite history store at {}", path.as_ref().display());
        Self::from_pool(pool, load_policy).await
    }

    /// Wrap an existing pool, creating the schema if needed
    pub async fn from_pool(pool: SqlitePool, load_policy: LoadPolicy) -> Result<Self> {
        let store = Self { pool, load_policy };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              timestamp TEXT NOT NULL,
              metadata TEXT,
              message_id TEXT,
              created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("create chat_messages table", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_session_id ON chat_messages (session_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("create session index", e))?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait::async_trait]
impl ChatHistoryStore for SqliteStore {
    async fn load_history(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT role, content, timestamp, metadata, message_id
            FROM chat_messages
            WHERE session_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("load conversation history", e))?;

        let messages = self
            .load_policy
            .collect(session_id, rows.iter().map(decode_row))?;

        debug!(session_id = %session_id, count = messages.len(), "Loaded history from SQLite");
        Ok(messages)
    }

    async fn save_history(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction for saving conversation history", e))?;

        sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("clear old conversation history", e))?;

        for message in messages {
            insert_query(session_id, message)?
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("insert conversation message", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit conversation history transaction", e))?;

        info!(session_id = %session_id, count = messages.len(), "Saved history to SQLite");
        Ok(())
    }

    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()> {
        insert_query(session_id, message)?
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("append conversation message", e))?;
        Ok(())
    }

    async fn clear_history(&self, session_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("clear conversation history", e))?;

        info!(
            session_id = %session_id,
            count = result.rows_affected(),
            "Cleared history from SQLite"
        );
        Ok(())
    }

    async fn list_sessions(&self) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT DISTINCT session_id FROM chat_messages")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("list sessions", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("session_id")
                    .map_err(|e| db_error("read session id", e))
            })
            .collect()
    }
}

fn insert_query<'q>(
    session_id: &'q str,
    message: &'q Message,
) -> Result<Query<'q, Sqlite, SqliteArguments<'q>>> {
    let metadata = serde_json::to_string(&message.metadata)?;

    Ok(sqlx::query(INSERT_MESSAGE)
        .bind(session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(encode_timestamp(&message.timestamp))
        .bind(metadata)
        .bind(&message.message_id))
}

fn encode_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn decode_row(row: &SqliteRow) -> std::result::Result<Message, String> {
    let role: String = row.try_get("role").map_err(|e| e.to_string())?;
    let content: String = row.try_get("content").map_err(|e| e.to_string())?;
    let raw_timestamp: String = row.try_get("timestamp").map_err(|e| e.to_string())?;
    let raw_metadata: Option<String> = row.try_get("metadata").map_err(|e| e.to_string())?;
    let message_id: Option<String> = row.try_get("message_id").map_err(|e| e.to_string())?;

    let timestamp = parse_timestamp(&raw_timestamp)
        .map_err(|e| format!("invalid timestamp {:?}: {}", raw_timestamp, e))?;

    Ok(Message {
        role: Role::from(role),
        content,
        timestamp,
        metadata: decode_metadata(raw_metadata.as_deref())?,
        session_id: None,
        message_id: message_id.unwrap_or_default(),
    })
}

fn db_error(step: &str, e: sqlx::Error) -> HistoryError {
    HistoryError::DatabaseError(format!("Failed to {}: {}", step, e))
}
