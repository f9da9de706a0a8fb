//! Incremental summarization strategy
//!
//! Folds older messages into a running chain of summary messages instead of
//! discarding them. Each summary records `summary_upto`, the id of the last
//! message it covers; the next pass only considers messages after that
//! anchor, so anchors only ever move forward through the conversation.
//! Summarizer failures are non-fatal: the input is returned unchanged.

use crate::message::{
    generate_message_id, timestamp_now, Message, Metadata, Role, META_ORIGINAL_COUNT,
    META_SUMMARY_UPTO, META_TIMESTAMP_CREATED, META_TYPE, SUMMARY_TYPE,
};
use crate::strategy::MemoryStrategy;
use crate::summarizer::Summarizer;
use crate::Result;
use chrono::SecondsFormat;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SUMMARY_PREFIX: &str = "[CONVERSATION_SUMMARY]: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarizationConfig {
    /// Apply only once the history holds more than this many messages
    pub trigger_count: usize,
    /// Most recent working-set messages that are never folded
    pub preserve_recent: usize,
    /// Keep plain (non-summary) system messages
    pub preserve_system: bool,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            trigger_count: 20,
            preserve_recent: 5,
            preserve_system: true,
        }
    }
}

pub struct SummarizationStrategy {
    summarizer: Arc<dyn Summarizer>,
    config: SummarizationConfig,
}

impl SummarizationStrategy {
    pub fn new(summarizer: Arc<dyn Summarizer>, config: SummarizationConfig) -> Self {
        info!(
            trigger_count = config.trigger_count,
            preserve_recent = config.preserve_recent,
            preserve_system = config.preserve_system,
            "Summarization strategy configured"
        );
        Self { summarizer, config }
    }

    pub fn config(&self) -> &SummarizationConfig {
        &self.config
    }

    fn build_summary(&self, text: &str, folded: &[&Message]) -> Message {
        let mut metadata = Metadata::new();
        metadata.insert(META_TYPE.to_string(), json!(SUMMARY_TYPE));
        metadata.insert(META_ORIGINAL_COUNT.to_string(), json!(folded.len()));

        let last = folded.last();
        if let Some(last) = last {
            metadata.insert(META_SUMMARY_UPTO.to_string(), json!(last.message_id));
            metadata.insert(
                META_TIMESTAMP_CREATED.to_string(),
                json!(last.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            );
        }

        Message {
            role: Role::System,
            content: format!("{}{}", SUMMARY_PREFIX, text),
            timestamp: timestamp_now(),
            metadata,
            session_id: last.and_then(|m| m.session_id.clone()),
            message_id: generate_message_id(),
        }
    }
}

#[async_trait::async_trait]
impl MemoryStrategy for SummarizationStrategy {
    fn name(&self) -> &'static str {
        "summarization"
    }

    fn should_apply(&self, messages: &[Message]) -> bool {
        let apply = messages.len() > self.config.trigger_count;
        debug!(
            count = messages.len(),
            trigger_count = self.config.trigger_count,
            apply,
            "Summarization check"
        );
        apply
    }

    async fn manage(&self, messages: &[Message]) -> Result<Vec<Message>> {
        if !self.should_apply(messages) {
            return Ok(messages.to_vec());
        }

        // Anchors are message ids, so every message needs one.
        let mut owned = messages.to_vec();
        for msg in owned.iter_mut() {
            msg.ensure_message_id();
        }

        let mut system = Vec::new();
        let mut summaries = Vec::new();
        let mut regular = Vec::new();
        for msg in &owned {
            if msg.is_summary() {
                summaries.push(msg);
            } else if msg.role == Role::System {
                if self.config.preserve_system {
                    system.push(msg);
                }
            } else {
                regular.push(msg);
            }
        }

        let anchor = summaries.iter().rev().find_map(|m| m.summary_anchor());

        let working: &[&Message] = match anchor {
            Some(anchor) => match regular.iter().position(|m| m.message_id == anchor) {
                Some(index) => &regular[index + 1..],
                // Already folded out of the list (or pruned by trimming).
                None => {
                    debug!("Summary anchor {} not in list, all regular messages are new", anchor);
                    &regular[..]
                }
            },
            None => &regular[..],
        };

        let split = working.len().saturating_sub(self.config.preserve_recent);
        let (summarizable, recent) = working.split_at(split);

        if summarizable.is_empty() {
            info!("No new messages to summarize");
            return Ok(messages.to_vec());
        }

        let batch: Vec<Message> = summarizable.iter().map(|m| (*m).clone()).collect();
        let text = match self.summarizer.summarize(&batch).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!("Summarizer returned empty text, keeping messages as-is");
                return Ok(messages.to_vec());
            }
            Err(e) => {
                warn!("Summarization failed, keeping messages as-is: {}", e);
                return Ok(messages.to_vec());
            }
        };

        let summary = self.build_summary(text.trim(), summarizable);
        info!(
            summary_id = %summary.message_id,
            folded = summarizable.len(),
            "Created summary message"
        );

        let result: Vec<Message> = system
            .into_iter()
            .chain(summaries)
            .cloned()
            .chain(std::iter::once(summary))
            .chain(recent.iter().map(|m| (*m).clone()))
            .collect();

        info!(
            "Summarization complete: {} messages reduced to {}",
            messages.len(),
            result.len()
        );
        Ok(result)
    }
}
