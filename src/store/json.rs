//! File-per-session JSON store
//!
//! Each session lives in `<dir>/<session_id>.json` as a pretty-printed
//! array of message records. Saves write a temp file and rename it over
//! the old one, so readers never observe a half-written history.

use crate::error::HistoryError;
use crate::locks::SessionLocks;
use crate::message::Message;
use crate::store::{ChatHistoryStore, LoadPolicy};
use crate::Result;
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

const EXTENSION: &str = "json";

pub struct JsonFileStore {
    dir: PathBuf,
    load_policy: LoadPolicy,
    locks: SessionLocks,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub async fn open(dir: impl AsRef<Path>, load_policy: LoadPolicy) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            HistoryError::StorageError(format!(
                "Failed to create history directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        info!("Initialized JSON history store at {}", dir.display());

        Ok(Self {
            dir,
            load_policy,
            locks: SessionLocks::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.{}", session_id, EXTENSION)))
    }

    /// Unlock the session and drop its slot unless another caller is
    /// queued on it.
    async fn release(&self, session_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks.remove_if(session_id, |_| true).await;
    }

    async fn read_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let path = self.file_path(session_id)?;

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(session_id = %session_id, "No history file, returning empty history");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(HistoryError::StorageError(format!(
                    "Failed to read history file {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let records: Vec<Value> = serde_json::from_slice(&bytes).map_err(|e| {
            HistoryError::corrupt(session_id, format!("not a JSON array of messages: {}", e))
        })?;

        self.load_policy.collect(
            session_id,
            records
                .into_iter()
                .map(|record| serde_json::from_value::<Message>(record).map_err(|e| e.to_string())),
        )
    }

    async fn write_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let path = self.file_path(session_id)?;

        if messages.is_empty() {
            return remove_if_exists(&path).await;
        }

        let payload = serde_json::to_vec_pretty(messages)?;
        let tmp_path = path.with_extension(format!("{}.tmp", EXTENSION));

        tokio::fs::write(&tmp_path, &payload).await.map_err(|e| {
            HistoryError::StorageError(format!(
                "Failed to write history file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(|e| {
            HistoryError::StorageError(format!(
                "Failed to replace history file {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl ChatHistoryStore for JsonFileStore {
    async fn load_history(&self, session_id: &str) -> Result<Vec<Message>> {
        let guard = self.locks.lock(session_id).await;
        let loaded = self.read_messages(session_id).await;
        self.release(session_id, guard).await;

        let messages = loaded?;
        debug!(session_id = %session_id, count = messages.len(), "Loaded history from JSON");
        Ok(messages)
    }

    async fn save_history(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let guard = self.locks.lock(session_id).await;
        let written = self.write_messages(session_id, messages).await;
        self.release(session_id, guard).await;

        written?;
        info!(session_id = %session_id, count = messages.len(), "Saved history to JSON");
        Ok(())
    }

    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let guard = self.locks.lock(session_id).await;
        let appended = async {
            let mut messages = self.read_messages(session_id).await?;
            messages.push(message.clone());
            self.write_messages(session_id, &messages).await
        }
        .await;
        self.release(session_id, guard).await;
        appended
    }

    async fn clear_history(&self, session_id: &str) -> Result<()> {
        let guard = self.locks.lock(session_id).await;
        let removed = match self.file_path(session_id) {
            Ok(path) => remove_if_exists(&path).await,
            Err(e) => Err(e),
        };
        self.release(session_id, guard).await;

        removed?;
        info!(session_id = %session_id, "Cleared JSON history");
        Ok(())
    }

    async fn list_sessions(&self) -> Result<BTreeSet<String>> {
        let mut sessions = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                sessions.insert(stem.to_string());
            }
        }

        Ok(sessions)
    }
}

/// Session ids become file names, so anything that could escape the
/// store directory is refused.
fn validate_session_id(session_id: &str) -> Result<()> {
    let invalid = session_id.trim().is_empty()
        || session_id.contains(['/', '\\', '\0'])
        || session_id.contains("..");

    if invalid {
        return Err(HistoryError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HistoryError::StorageError(format!(
            "Failed to remove history file {}: {}",
            path.display(),
            e
        ))),
    }
}
