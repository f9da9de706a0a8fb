//! Client/server relational store (Postgres via sqlx)
//!
//! Same row-per-message layout as the SQLite store, with native
//! `TIMESTAMPTZ` timestamps and `JSONB` metadata. The pool connects lazily
//! and the schema is created once, on first use.

use crate::error::HistoryError;
use crate::message::{Message, Role};
use crate::store::{decode_metadata, ChatHistoryStore, LoadPolicy};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::BTreeSet;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const INSERT_MESSAGE: &str = r#"
    INSERT INTO chat_messages
      (session_id, role, content, timestamp, metadata, message_id)
    VALUES
      ($1, $2, $3, $4, $5::jsonb, $6)
"#;

pub struct PostgresStore {
    pool: PgPool,
    load_policy: LoadPolicy,
    schema_ready: OnceCell<()>,
}

impl PostgresStore {
    /// Build a lazily-connecting pool for `url`
    pub fn connect_lazy(url: &str, max_connections: u32, load_policy: LoadPolicy) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_lazy(url)
            .map_err(|e| db_error("configure postgres pool", e))?;

        Ok(Self::from_pool(pool, load_policy))
    }

    pub fn from_pool(pool: PgPool, load_policy: LoadPolicy) -> Self {
        Self {
            pool,
            load_policy,
            schema_ready: OnceCell::new(),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS chat_messages (
                      id BIGSERIAL PRIMARY KEY,
                      session_id TEXT NOT NULL,
                      role TEXT NOT NULL,
                      content TEXT NOT NULL,
                      timestamp TIMESTAMPTZ NOT NULL,
                      metadata JSONB DEFAULT '{}',
                      message_id TEXT,
                      created_at TIMESTAMPTZ DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_chat_messages_session_id
                    ON chat_messages (session_id);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                info!("Postgres chat history schema ready");
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| db_error("initialize chat history schema", e))?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn insert<'e, E>(&self, executor: E, session_id: &str, message: &Message) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let metadata = serde_json::to_string(&message.metadata)?;

        sqlx::query(INSERT_MESSAGE)
            .bind(session_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.timestamp)
            .bind(metadata)
            .bind(&message.message_id)
            .execute(executor)
            .await
            .map_err(|e| db_error("insert conversation message", e))?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl ChatHistoryStore for PostgresStore {
    async fn load_history(&self, session_id: &str) -> Result<Vec<Message>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT role, content, timestamp, metadata::text AS metadata, message_id
            FROM chat_messages
            WHERE session_id = $1
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

        debug!(session_id = %session_id, count = messages.len(), "Loaded history from Postgres");
        Ok(messages)
    }

    async fn save_history(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        self.ensure_schema().await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction for saving conversation history", e))?;

        sqlx::query("DELETE FROM chat_messages WHERE session_id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("clear old conversation history", e))?;

        for message in messages {
            self.insert(&mut *tx, session_id, message).await?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit conversation history transaction", e))?;

        info!(session_id = %session_id, count = messages.len(), "Saved history to Postgres");
        Ok(())
    }

    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()> {
        self.ensure_schema().await?;
        self.insert(&self.pool, session_id, message).await
    }

    async fn clear_history(&self, session_id: &str) -> Result<()> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM chat_messages WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("clear conversation history", e))?;

        info!(
            session_id = %session_id,
            count = result.rows_affected(),
            "Cleared history from Postgres"
        );
        Ok(())
    }

    async fn list_sessions(&self) -> Result<BTreeSet<String>> {
        self.ensure_schema().await?;

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

fn decode_row(row: &PgRow) -> std::result::Result<Message, String> {
    let role: String = row.try_get("role").map_err(|e| e.to_string())?;
    let content: String = row.try_get("content").map_err(|e| e.to_string())?;
    let timestamp: DateTime<Utc> = row.try_get("timestamp").map_err(|e| e.to_string())?;
    let raw_metadata: Option<String> = row.try_get("metadata").map_err(|e| e.to_string())?;
    let message_id: Option<String> = row.try_get("message_id").map_err(|e| e.to_string())?;

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
