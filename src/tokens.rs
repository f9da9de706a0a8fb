//! Approximate token counting
//!
//! This is a character-based estimate (~4 characters per token), not a real
//! tokenizer. Budgets built on it are approximate.

use crate::message::Message;

const DEFAULT_CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct TokenCounter {
    chars_per_token: usize,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }

    /// Use a custom characters-per-token ratio (clamped to at least 1)
    pub fn with_chars_per_token(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    /// Empty text is 0 tokens; any non-empty text is at least 1.
    pub fn count(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        (chars / self.chars_per_token).max(1)
    }

    pub fn count_message(&self, message: &Message) -> usize {
        self.count(&message.content)
    }

    pub fn count_messages<'a, I>(&self, messages: I) -> usize
    where
        I: IntoIterator<Item = &'a Message>,
    {
        messages.into_iter().map(|m| self.count_message(m)).sum()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}
