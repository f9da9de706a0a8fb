//! Trimming strategy
//!
//! Drops the oldest unprotected messages until the history fits a message
//! count and/or approximate token budget. System messages (optionally) and
//! the most recent non-system messages are protected. The token bound is
//! best-effort: protected messages alone may already exceed it.

use crate::error::HistoryError;
use crate::message::{Message, Role};
use crate::strategy::MemoryStrategy;
use crate::tokens::TokenCounter;
use crate::Result;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimmingConfig {
    pub max_messages: Option<usize>,
    pub max_tokens: Option<usize>,
    pub preserve_system: bool,
    /// Most recent non-system messages that are never trimmed
    pub preserve_recent: usize,
}

impl Default for TrimmingConfig {
    fn default() -> Self {
        Self {
            max_messages: None,
            max_tokens: None,
            preserve_system: true,
            preserve_recent: 2,
        }
    }
}

pub struct TrimmingStrategy {
    config: TrimmingConfig,
    counter: TokenCounter,
}

impl TrimmingStrategy {
    pub fn new(config: TrimmingConfig) -> Result<Self> {
        Self::with_counter(config, TokenCounter::new())
    }

    pub fn with_counter(config: TrimmingConfig, counter: TokenCounter) -> Result<Self> {
        if config.max_messages.is_none() && config.max_tokens.is_none() {
            return Err(HistoryError::ConfigError(
                "trimming needs max_messages or max_tokens".to_string(),
            ));
        }
        if config.max_messages == Some(0) || config.max_tokens == Some(0) {
            return Err(HistoryError::ConfigError(
                "trimming limits must be greater than zero".to_string(),
            ));
        }

        info!(
            max_messages = ?config.max_messages,
            max_tokens = ?config.max_tokens,
            preserve_system = config.preserve_system,
            preserve_recent = config.preserve_recent,
            "Trimming strategy configured"
        );

        Ok(Self { config, counter })
    }

    pub fn config(&self) -> &TrimmingConfig {
        &self.config
    }

    /// Split into (system, trimmable, recent), each in original order
    fn partition<'a>(
        &self,
        messages: &'a [Message],
    ) -> (Vec<&'a Message>, VecDeque<&'a Message>, Vec<&'a Message>) {
        let system: Vec<&Message> = if self.config.preserve_system {
            messages.iter().filter(|m| m.role == Role::System).collect()
        } else {
            Vec::new()
        };

        let mut trimmable: VecDeque<&Message> =
            messages.iter().filter(|m| m.role != Role::System).collect();
        let split = trimmable.len().saturating_sub(self.config.preserve_recent);
        let recent: Vec<&Message> = trimmable.split_off(split).into_iter().collect();

        (system, trimmable, recent)
    }

    fn apply_message_limit(&self, protected: usize, trimmable: &mut VecDeque<&Message>) {
        let Some(max_messages) = self.config.max_messages else {
            return;
        };

        let slots = max_messages.saturating_sub(protected);
        let excess = trimmable.len().saturating_sub(slots);
        if excess > 0 {
            trimmable.drain(..excess);
            info!("Trimmed {} messages due to message limit", excess);
        }
    }

    fn apply_token_limit(
        &self,
        system: &[&Message],
        trimmable: &mut VecDeque<&Message>,
        recent: &[&Message],
    ) {
        let Some(max_tokens) = self.config.max_tokens else {
            return;
        };

        let mut total = self.counter.count_messages(system.iter().copied())
            + self.counter.count_messages(trimmable.iter().copied())
            + self.counter.count_messages(recent.iter().copied());

        let mut dropped = 0;
        while total > max_tokens {
            let Some(oldest) = trimmable.pop_front() else {
                break;
            };
            total -= self.counter.count_message(oldest);
            dropped += 1;
        }

        if dropped > 0 {
            info!("Trimmed {} messages due to token limit", dropped);
        }
        if total > max_tokens {
            warn!(
                "Unable to reach token limit: {} tokens remain in protected messages (max {})",
                total, max_tokens
            );
        }
    }
}

#[async_trait::async_trait]
impl MemoryStrategy for TrimmingStrategy {
    fn name(&self) -> &'static str {
        "trimming"
    }

    fn should_apply(&self, messages: &[Message]) -> bool {
        let over_count = self
            .config
            .max_messages
            .is_some_and(|max| messages.len() > max);

        let over_tokens = self
            .config
            .max_tokens
            .is_some_and(|max| self.counter.count_messages(messages) > max);

        debug!(count = messages.len(), over_count, over_tokens, "Trimming check");
        over_count || over_tokens
    }

    async fn manage(&self, messages: &[Message]) -> Result<Vec<Message>> {
        if !self.should_apply(messages) {
            return Ok(messages.to_vec());
        }

        let (system, mut trimmable, recent) = self.partition(messages);
        self.apply_message_limit(system.len() + recent.len(), &mut trimmable);
        self.apply_token_limit(&system, &mut trimmable, &recent);

        let result: Vec<Message> = system
            .into_iter()
            .chain(trimmable)
            .chain(recent)
            .cloned()
            .collect();

        info!(
            "Trimming complete: {} messages reduced to {}",
            messages.len(),
            result.len()
        );
        Ok(result)
    }
}
