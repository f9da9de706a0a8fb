//! Memory management strategies
//!
//! A strategy keeps a session's message list within budget. `manage` may
//! drop or replace messages but never reorders the ones it keeps.

pub mod summarization;
pub mod trimming;

pub use summarization::{SummarizationConfig, SummarizationStrategy};
pub use trimming::{TrimmingConfig, TrimmingStrategy};

use crate::message::Message;
use crate::Result;

#[async_trait::async_trait]
pub trait MemoryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap pre-check; when false, `manage` returns its input unchanged.
    fn should_apply(&self, messages: &[Message]) -> bool;

    async fn manage(&self, messages: &[Message]) -> Result<Vec<Message>>;
}
