//! Conversation summarization capability
//!
//! `Summarizer` is what `SummarizationStrategy` calls. `LlmSummarizer`
//! adapts any prompt-in/text-out `LanguageModel` into a `Summarizer`.

use crate::error::HistoryError;
use crate::message::{ContextMessage, Message, Role};
use crate::Result;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = "You are a helpful assistant that summarizes conversations.";

/// Turns a run of messages into summary text, or fails
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String>;
}

/// Opaque language model: given a prompt, produce text or fail
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    async fn invoke(&self, prompt: &[ContextMessage]) -> Result<String>;
}

/// Summarizes by prompting a language model
pub struct LlmSummarizer<M> {
    model: M,
}

impl<M: LanguageModel> LlmSummarizer<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    fn build_prompt(messages: &[Message]) -> Vec<ContextMessage> {
        vec![
            ContextMessage::new(Role::System, SYSTEM_PROMPT),
            ContextMessage::new(
                Role::User,
                format!(
                    "Summarize the following conversation:\n\n{}",
                    format_messages_for_summary(messages)
                ),
            ),
        ]
    }
}

#[async_trait::async_trait]
impl<M: LanguageModel> Summarizer for LlmSummarizer<M> {
    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        if messages.is_empty() {
            return Err(HistoryError::SummarizationError(
                "Cannot summarize empty message list".to_string(),
            ));
        }

        info!("Calling language model to summarize {} messages", messages.len());

        match self.model.invoke(&Self::build_prompt(messages)).await {
            Ok(summary) => Ok(summary.trim().to_string()),
            Err(e) => {
                warn!("Failed to summarize context: {}", e);
                Err(e)
            }
        }
    }
}

/// Format messages into readable text for summarization
pub fn format_messages_for_summary(messages: &[Message]) -> String {
    let mut text = String::new();

    for msg in messages {
        let role_str = match &msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
            Role::Other(name) => name.as_str(),
        };

        text.push_str(&format!("{}: {}\n", role_str, msg.content));
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every prompt it receives
    struct RecordingModel {
        prompts: Mutex<Vec<Vec<ContextMessage>>>,
    }

    #[async_trait::async_trait]
    impl LanguageModel for RecordingModel {
        async fn invoke(&self, prompt: &[ContextMessage]) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_vec());
            Ok("  user asked about RSI  ".to_string())
        }
    }

    struct DownModel;

    #[async_trait::async_trait]
    impl LanguageModel for DownModel {
        async fn invoke(&self, _prompt: &[ContextMessage]) -> Result<String> {
            Err(HistoryError::SummarizationError("model unavailable".to_string()))
        }
    }

    #[test]
    fn test_format_messages_for_summary() {
        let messages = vec![
            Message::user("What is RSI?"),
            Message::assistant("RSI is a momentum indicator..."),
            Message::new(Role::Other("tool".to_string()), "lookup ok"),
        ];

        let formatted = format_messages_for_summary(&messages);
        assert!(formatted.contains("User: What is RSI?"));
        assert!(formatted.contains("Assistant: RSI"));
        assert!(formatted.contains("tool: lookup ok"));
    }

    #[tokio::test]
    async fn test_llm_summarizer_prompt_shape() {
        let summarizer = LlmSummarizer::new(RecordingModel {
            prompts: Mutex::new(Vec::new()),
        });

        let summary = summarizer
            .summarize(&[Message::user("What is RSI?")])
            .await
            .unwrap();
        assert_eq!(summary, "user asked about RSI");

        let prompts = summarizer.model.prompts.lock().unwrap();
        let prompt = &prompts[0];
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[0].role, Role::System);
        assert_eq!(prompt[1].role, Role::User);
        assert!(prompt[1].content.ends_with("User: What is RSI?\n"));
    }

    #[tokio::test]
    async fn test_llm_summarizer_errors() {
        let summarizer = LlmSummarizer::new(DownModel);
        assert!(summarizer.summarize(&[Message::user("hi")]).await.is_err());
        assert!(summarizer.summarize(&[]).await.is_err());
    }
}
