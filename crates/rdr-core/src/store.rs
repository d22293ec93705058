//! Collaborator ports over the relational store.
//!
//! The CRUD layer that maintains these records lives in another process;
//! the core only reads them, except for the credential write that completes
//! a registration.

use async_trait::async_trait;

use crate::domain::{ChatId, Credential, MessageId, ThreadHit, Topic, UserId};
use crate::Result;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, user_id: UserId) -> Result<Option<Credential>>;

    /// Every persisted credential, for boot-time rehydration.
    async fn all(&self) -> Result<Vec<Credential>>;

    /// Insert or replace the credential row for `credential.user_id`.
    async fn upsert(&self, credential: Credential) -> Result<()>;
}

#[async_trait]
pub trait ChatDirectory: Send + Sync {
    /// The chat ids a user's session is allowed to observe.
    async fn active_chat_ids(&self, user_id: UserId) -> Result<Vec<ChatId>>;
}

#[async_trait]
pub trait TopicDirectory: Send + Sync {
    /// The topic set bound to one chat.
    async fn topics(&self, user_id: UserId, chat_id: ChatId) -> Result<Vec<Topic>>;
}

#[async_trait]
pub trait ThreadIndex: Send + Sync {
    /// Resolve a replied-to message id to the reply-thread it belongs to.
    async fn thread_for_message(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<ThreadHit>>;
}
