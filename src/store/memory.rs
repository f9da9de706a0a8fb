//! In-memory history store
//!
//! Process-lifetime storage with no serialization. Used as the default
//! backend and as the baseline in tests.

use crate::message::Message;
use crate::store::{ChatHistoryStore, LoadPolicy};
use crate::Result;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct InMemoryStore {
    histories: Arc<RwLock<HashMap<String, Vec<Message>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            histories: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChatHistoryStore for InMemoryStore {
    async fn load_history(&self, session_id: &str) -> Result<Vec<Message>> {
        let stored = self
            .histories
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        // Records are already decoded, so only the normalization applies.
        let messages = LoadPolicy::FailFast.collect(session_id, stored.into_iter().map(Ok))?;
        debug!(session_id = %session_id, count = messages.len(), "Loaded history from memory");
        Ok(messages)
    }

    async fn save_history(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let mut histories = self.histories.write().await;
        if messages.is_empty() {
            histories.remove(session_id);
        } else {
            histories.insert(session_id.to_string(), messages.to_vec());
        }
        info!(session_id = %session_id, count = messages.len(), "Saved history to memory");
        Ok(())
    }

    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let mut histories = self.histories.write().await;
        histories
            .entry(session_id.to_string())
            .or_insert_with(Vec::new)
            .push(message.clone());
        Ok(())
    }

    async fn clear_history(&self, session_id: &str) -> Result<()> {
        let removed = self.histories.write().await.remove(session_id);
        if let Some(messages) = removed {
            info!(session_id = %session_id, count = messages.len(), "Cleared history from memory");
        }
        Ok(())
    }

    async fn list_sessions(&self) -> Result<BTreeSet<String>> {
        Ok(self.histories.read().await.keys().cloned().collect())
    }
}
