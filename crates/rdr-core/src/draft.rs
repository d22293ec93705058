//! Port over the external reply drafter.
//!
//! Turning a matched message into reply text (prompting, dialog history,
//! model calls) happens outside the core; the relay only needs the finished
//! text to push through the right session.

use async_trait::async_trait;

use crate::domain::ReplyTask;
use crate::Result;

#[async_trait]
pub trait ReplyDrafter: Send + Sync {
    /// Produce the reply text for a matched message.
    async fn draft(&self, task: &ReplyTask) -> Result<String>;
}
