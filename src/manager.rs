//! Chat history manager
//!
//! The API application code talks to. Fronts a `ChatHistoryStore` with a
//! per-session cache and applies the configured `MemoryStrategy` on every
//! append. Each session's cache entry sits behind its own async mutex, so
//! the load → append → manage → save cycle is serialized per session while
//! different sessions proceed independently.

use crate::config::HistoryConfig;
use crate::error::HistoryError;
use crate::locks::SessionLocks;
use crate::message::{ContextMessage, Message, Metadata, Role, SessionStats};
use crate::store::{build_store, ChatHistoryStore};
use crate::strategy::{MemoryStrategy, TrimmingStrategy};
use crate::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

type CacheEntry = Option<Vec<Message>>;

pub struct ChatHistoryManager {
    store: Arc<dyn ChatHistoryStore>,
    strategy: Option<Arc<dyn MemoryStrategy>>,
    auto_save: bool,
    cache: SessionLocks<CacheEntry>,
}

impl ChatHistoryManager {
    pub fn new(store: Arc<dyn ChatHistoryStore>) -> Self {
        Self {
            store,
            strategy: None,
            auto_save: true,
            cache: SessionLocks::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn MemoryStrategy>) -> Self {
        info!("Chat history strategy: {}", strategy.name());
        self.strategy = Some(strategy);
        self
    }

    pub fn with_auto_save(mut self, auto_save: bool) -> Self {
        self.auto_save = auto_save;
        self
    }

    /// Build store, optional trimming strategy and save policy from config
    pub async fn from_config(config: &HistoryConfig) -> Result<Self> {
        let store = build_store(config).await?;
        let mut manager = Self::new(store).with_auto_save(config.auto_save);

        if let Some(trimming) = &config.trimming {
            let strategy = TrimmingStrategy::new(trimming.clone())?;
            manager = manager.with_strategy(Arc::new(strategy));
        }

        Ok(manager)
    }

    pub fn store(&self) -> &Arc<dyn ChatHistoryStore> {
        &self.store
    }

    /// Make sure `entry` holds the session's messages, loading from the
    /// store on a miss (or always, when `force_reload`).
    async fn ensure_loaded<'a>(
        &self,
        session_id: &str,
        entry: &'a mut CacheEntry,
        force_reload: bool,
    ) -> Result<&'a mut Vec<Message>> {
        if force_reload || entry.is_none() {
            let loaded = self.store.load_history(session_id).await?;
            debug!(session_id = %session_id, count = loaded.len(), "Loaded history into cache");
            *entry = Some(loaded);
        }
        Ok(entry.get_or_insert_with(Vec::new))
    }

    /// Append a message and return it. The returned message is the one
    /// constructed here, not the (possibly summarized) cached view.
    pub async fn add_message(
        &self,
        session_id: &str,
        role: impl Into<Role>,
        content: impl Into<String>,
        metadata: Option<Metadata>,
        message_id: Option<String>,
    ) -> Result<Message> {
        let mut message = Message::new(role, content)
            .with_session(session_id)
            .with_metadata(metadata.unwrap_or_default());
        if let Some(id) = message_id.filter(|id| !id.trim().is_empty()) {
            message.message_id = id;
        }

        let mut entry = self.cache.lock(session_id).await;
        let messages = self.ensure_loaded(session_id, &mut entry, false).await?;

        if messages.iter().any(|m| m.message_id == message.message_id) {
            return Err(HistoryError::DuplicateMessageId {
                session_id: session_id.to_string(),
                message_id: message.message_id,
            });
        }

        messages.push(message.clone());
        debug!(session_id = %session_id, count = messages.len(), "Appended message to cache");

        if let Some(strategy) = &self.strategy {
            let before = messages.len();
            let managed = strategy.manage(messages).await?;
            *messages = managed;

            if before != messages.len() {
                info!(
                    session_id = %session_id,
                    strategy = strategy.name(),
                    "Memory strategy reduced messages from {} to {}",
                    before,
                    messages.len()
                );
            }
        }

        if self.auto_save {
            self.store.save_history(session_id, messages).await?;
        }

        Ok(message)
    }

    /// Copy of the session's current history
    pub async fn get_history(&self, session_id: &str, force_reload: bool) -> Result<Vec<Message>> {
        let mut entry = self.cache.lock(session_id).await;
        let messages = self
            .ensure_loaded(session_id, &mut entry, force_reload)
            .await?;
        Ok(messages.clone())
    }

    /// `{role, content}` pairs for a model call: role filter first, then the
    /// trailing `max_messages` of what remains. An empty role list and a
    /// zero limit both mean "all".
    pub async fn get_context(
        &self,
        session_id: &str,
        max_messages: Option<usize>,
        roles: Option<&[Role]>,
    ) -> Result<Vec<ContextMessage>> {
        let history = self.get_history(session_id, false).await?;

        let filtered: Vec<&Message> = history
            .iter()
            .filter(|m| {
                roles
                    .filter(|allowed| !allowed.is_empty())
                    .map_or(true, |allowed| allowed.contains(&m.role))
            })
            .collect();

        let start = max_messages
            .filter(|&max| max > 0)
            .map_or(0, |max| filtered.len().saturating_sub(max));
        let context: Vec<ContextMessage> =
            filtered[start..].iter().map(|m| m.to_context()).collect();

        debug!(
            session_id = %session_id,
            count = context.len(),
            "Built context from {} messages",
            history.len()
        );
        Ok(context)
    }

    /// Remove the session from the store and the cache
    pub async fn clear_session(&self, session_id: &str) -> Result<()> {
        let mut entry = self.cache.lock(session_id).await;
        self.store.clear_history(session_id).await?;
        *entry = None;
        drop(entry);

        self.cache.remove_if(session_id, Option::is_none).await;
        info!(session_id = %session_id, "Cleared session");
        Ok(())
    }

    /// Persist whatever is cached for the session. Nothing cached is a
    /// no-op.
    pub async fn save_session(&self, session_id: &str) -> Result<()> {
        let entry = self.cache.lock(session_id).await;
        match entry.as_ref() {
            Some(messages) => {
                self.store.save_history(session_id, messages).await?;
                info!(session_id = %session_id, count = messages.len(), "Saved session");
            }
            None => {
                warn!(session_id = %session_id, "Attempted to save session that is not cached");
            }
        }
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<BTreeSet<String>> {
        self.store.list_sessions().await
    }

    pub async fn get_session_stats(&self, session_id: &str) -> Result<SessionStats> {
        let history = self.get_history(session_id, false).await?;
        Ok(SessionStats::from_messages(&history))
    }

    /// Sessions currently held in the cache
    pub async fn cached_sessions(&self) -> BTreeSet<String> {
        let mut cached = BTreeSet::new();
        for (session_id, slot) in self.cache.entries().await {
            if slot.lock().await.is_some() {
                cached.insert(session_id);
            }
        }
        cached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::store::InMemoryStore;
    use crate::strategy::{SummarizationConfig, SummarizationStrategy, TrimmingConfig};
    use crate::summarizer::Summarizer;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn manager() -> (Arc<InMemoryStore>, ChatHistoryManager) {
        init_tracing();
        let store = Arc::new(InMemoryStore::new());
        let manager = ChatHistoryManager::new(store.clone());
        (store, manager)
    }

    /// In-memory store whose saves can be switched off
    struct FlakyStore {
        inner: InMemoryStore,
        fail_saves: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ChatHistoryStore for FlakyStore {
        async fn load_history(&self, session_id: &str) -> Result<Vec<Message>> {
            self.inner.load_history(session_id).await
        }

        async fn save_history(&self, session_id: &str, messages: &[Message]) -> Result<()> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(HistoryError::StorageError("disk full".to_string()));
            }
            self.inner.save_history(session_id, messages).await
        }

        async fn append_message(&self, session_id: &str, message: &Message) -> Result<()> {
            self.inner.append_message(session_id, message).await
        }

        async fn clear_history(&self, session_id: &str) -> Result<()> {
            self.inner.clear_history(session_id).await
        }

        async fn list_sessions(&self) -> Result<BTreeSet<String>> {
            self.inner.list_sessions().await
        }
    }

    struct OfflineSummarizer;

    #[async_trait::async_trait]
    impl Summarizer for OfflineSummarizer {
        async fn summarize(&self, _messages: &[Message]) -> Result<String> {
            Err(HistoryError::SummarizationError("offline".to_string()))
        }
    }

    struct CountingSummarizer;

    #[async_trait::async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(&self, messages: &[Message]) -> Result<String> {
            Ok(format!("{} messages", messages.len()))
        }
    }

    #[tokio::test]
    async fn test_added_message_is_visible_without_reload() {
        let (store, manager) = manager();

        let msg = manager
            .add_message("s1", Role::User, "hello", None, None)
            .await
            .unwrap();
        assert_eq!(msg.session_id.as_deref(), Some("s1"));

        let history = manager.get_history("s1", false).await.unwrap();
        assert_eq!(history, vec![msg.clone()]);
        assert_eq!(store.load_history("s1").await.unwrap(), vec![msg]);
    }

    #[tokio::test]
    async fn test_lazy_load_appends_to_persisted_history() {
        let (store, manager) = manager();
        let earlier = vec![Message::user("earlier").with_session("s1")];
        store.save_history("s1", &earlier).await.unwrap();

        manager
            .add_message("s1", Role::Assistant, "later", None, None)
            .await
            .unwrap();

        let contents: Vec<String> = manager
            .get_history("s1", false)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["earlier", "later"]);
    }

    #[tokio::test]
    async fn test_message_ids() {
        let (_store, manager) = manager();

        let given = manager
            .add_message("s1", Role::User, "a", None, Some("m-1".to_string()))
            .await
            .unwrap();
        assert_eq!(given.message_id, "m-1");

        let blank = manager
            .add_message("s1", Role::User, "b", None, Some("  ".to_string()))
            .await
            .unwrap();
        assert!(!blank.message_id.trim().is_empty());

        let duplicate = manager
            .add_message("s1", Role::User, "c", None, Some("m-1".to_string()))
            .await;
        assert!(matches!(
            duplicate,
            Err(HistoryError::DuplicateMessageId { .. })
        ));
        assert_eq!(manager.get_history("s1", false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_context_filters_then_truncates() {
        let (_store, manager) = manager();
        manager.add_message("s1", Role::System, "sys", None, None).await.unwrap();
        manager.add_message("s1", Role::User, "a", None, None).await.unwrap();
        manager.add_message("s1", Role::Assistant, "b", None, None).await.unwrap();
        manager.add_message("s1", Role::User, "c", None, None).await.unwrap();

        let context = manager
            .get_context("s1", Some(2), Some(&[Role::User]))
            .await
            .unwrap();
        assert_eq!(
            context,
            vec![
                ContextMessage::new(Role::User, "a"),
                ContextMessage::new(Role::User, "c")
            ]
        );

        let tail = manager.get_context("s1", Some(2), None).await.unwrap();
        assert_eq!(
            tail,
            vec![
                ContextMessage::new(Role::Assistant, "b"),
                ContextMessage::new(Role::User, "c")
            ]
        );

        assert_eq!(manager.get_context("s1", None, None).await.unwrap().len(), 4);
        assert_eq!(manager.get_context("s1", Some(0), None).await.unwrap().len(), 4);
        assert_eq!(manager.get_context("s1", None, Some(&[])).await.unwrap().len(), 4);
        assert_eq!(
            manager.get_context("s1", Some(0), Some(&[])).await.unwrap(),
            manager.get_context("s1", None, None).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_auto_save_disabled_requires_save_session() {
        let (store, manager) = manager();
        let manager = manager.with_auto_save(false);

        manager.add_message("s1", Role::User, "draft", None, None).await.unwrap();
        assert!(store.load_history("s1").await.unwrap().is_empty());

        assert_ok!(manager.save_session("s1").await);
        assert_eq!(store.load_history("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_uncached_session_is_noop() {
        let (store, manager) = manager();
        assert_ok!(manager.save_session("ghost").await);
        assert!(store.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_session() {
        let (store, manager) = manager();
        manager.add_message("s1", Role::User, "a", None, None).await.unwrap();
        manager.add_message("s2", Role::User, "b", None, None).await.unwrap();
        assert_eq!(manager.cached_sessions().await.len(), 2);

        manager.clear_session("s1").await.unwrap();
        manager.clear_session("s1").await.unwrap();
        assert_eq!(manager.cache.keys().await, vec!["s2".to_string()]);

        assert!(manager.get_history("s1", false).await.unwrap().is_empty());
        assert!(store.load_history("s1").await.unwrap().is_empty());
        let sessions = manager.list_sessions().await.unwrap();
        assert_eq!(sessions.into_iter().collect::<Vec<_>>(), vec!["s2"]);
    }

    #[tokio::test]
    async fn test_force_reload_picks_up_store_changes() {
        let (store, manager) = manager();
        manager.add_message("s1", Role::User, "a", None, None).await.unwrap();

        store
            .save_history("s1", &[Message::user("replaced").with_session("s1")])
            .await
            .unwrap();

        let cached = manager.get_history("s1", false).await.unwrap();
        assert_eq!(cached[0].content, "a");
        let reloaded = manager.get_history("s1", true).await.unwrap();
        assert_eq!(reloaded[0].content, "replaced");
    }

    #[tokio::test]
    async fn test_session_stats() {
        let (_store, manager) = manager();
        manager.add_message("s1", Role::System, "rules", None, None).await.unwrap();
        manager.add_message("s1", Role::User, "q", None, None).await.unwrap();
        manager.add_message("s1", Role::Assistant, "a", None, None).await.unwrap();
        manager.add_message("s1", Role::User, "q2", None, None).await.unwrap();

        let stats = manager.get_session_stats("s1").await.unwrap();
        assert_eq!(stats.total_messages, 4);
        assert_eq!(stats.role_distribution["user"], 2);
        assert_eq!(stats.summary_count, 0);
        assert!(stats.first_message_time <= stats.last_message_time);

        let empty = manager.get_session_stats("nobody").await.unwrap();
        assert_eq!(empty.total_messages, 0);
        assert!(empty.last_message_time.is_none());
    }

    #[tokio::test]
    async fn test_trimming_strategy_bounds_cache_and_store() {
        let (store, manager) = manager();
        let strategy = TrimmingStrategy::new(TrimmingConfig {
            max_messages: Some(5),
            preserve_recent: 2,
            ..TrimmingConfig::default()
        })
        .unwrap();
        let manager = manager.with_strategy(Arc::new(strategy));

        manager.add_message("s1", Role::System, "sys", None, None).await.unwrap();
        for i in 1..=10 {
            manager
                .add_message("s1", Role::User, format!("m{}", i), None, None)
                .await
                .unwrap();
        }

        let contents: Vec<String> = manager
            .get_history("s1", false)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["sys", "m7", "m8", "m9", "m10"]);
        assert_eq!(store.load_history("s1").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_summarization_through_manager() {
        let (_store, manager) = manager();
        let strategy = SummarizationStrategy::new(
            Arc::new(CountingSummarizer),
            SummarizationConfig {
                trigger_count: 6,
                preserve_recent: 2,
                preserve_system: true,
            },
        );
        let manager = manager.with_strategy(Arc::new(strategy));

        for i in 1..=7 {
            let returned = manager
                .add_message("s1", Role::User, format!("m{}", i), None, None)
                .await
                .unwrap();
            assert_eq!(returned.content, format!("m{}", i));
        }

        let history = manager.get_history("s1", false).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].is_summary());
        assert_eq!(history[0].content, "[CONVERSATION_SUMMARY]: 5 messages");
        assert_eq!(history[0].session_id.as_deref(), Some("s1"));

        let stats = manager.get_session_stats("s1").await.unwrap();
        assert_eq!(stats.summary_count, 1);
    }

    #[tokio::test]
    async fn test_failed_summarization_keeps_growing() {
        let (_store, manager) = manager();
        let strategy = SummarizationStrategy::new(
            Arc::new(OfflineSummarizer),
            SummarizationConfig {
                trigger_count: 3,
                preserve_recent: 1,
                preserve_system: true,
            },
        );
        let manager = manager.with_strategy(Arc::new(strategy));

        for i in 0..6 {
            manager
                .add_message("s1", Role::User, format!("m{}", i), None, None)
                .await
                .unwrap();
        }
        assert_eq!(manager.get_history("s1", false).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_save_failure_propagates_but_cache_keeps_message() {
        init_tracing();
        let store = Arc::new(FlakyStore {
            inner: InMemoryStore::new(),
            fail_saves: AtomicBool::new(true),
        });
        let manager = ChatHistoryManager::new(store.clone());

        assert_err!(manager.add_message("s1", Role::User, "a", None, None).await);
        assert_eq!(manager.get_history("s1", false).await.unwrap().len(), 1);
        assert!(store.load_history("s1").await.unwrap().is_empty());

        store.fail_saves.store(false, Ordering::SeqCst);
        manager.save_session("s1").await.unwrap();
        assert_eq!(store.load_history("s1").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_to_one_session_are_not_lost() {
        let (store, manager) = manager();
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for i in 0..50 {
            let manager = manager.clone();
            let session_id = if i % 5 == 0 { "other" } else { "busy" };
            handles.push(tokio::spawn(async move {
                manager
                    .add_message(session_id, Role::User, format!("m{}", i), None, None)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(manager.get_history("busy", false).await.unwrap().len(), 40);
        assert_eq!(manager.get_history("other", false).await.unwrap().len(), 10);
        assert_eq!(store.load_history("busy").await.unwrap().len(), 40);
        assert_eq!(store.load_history("other").await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_from_config_with_json_backend_and_trimming() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let config = HistoryConfig {
            backend: BackendKind::Json {
                dir: tmp.path().to_path_buf(),
            },
            trimming: Some(TrimmingConfig {
                max_messages: Some(3),
                preserve_recent: 1,
                ..TrimmingConfig::default()
            }),
            ..HistoryConfig::default()
        };

        let manager = ChatHistoryManager::from_config(&config).await.unwrap();
        for i in 0..5 {
            manager
                .add_message("s1", Role::User, format!("m{}", i), None, None)
                .await
                .unwrap();
        }

        // A fresh manager over the same directory sees the trimmed history.
        let reopened = ChatHistoryManager::from_config(&config).await.unwrap();
        let contents: Vec<String> = reopened
            .get_history("s1", false)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }
}
