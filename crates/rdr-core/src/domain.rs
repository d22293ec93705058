use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chat-network user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Chat id (numeric; groups are negative on the wire, we don't care).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

/// Message id, unique within a chat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i32);

/// User-defined topic id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub i64);

/// Reply-thread id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub i64);

macro_rules! display_as_inner {
    ($($ty:ty),*) => {$(
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    )*};
}

display_as_inner!(UserId, ChatId, MessageId, TopicId, ThreadId);

/// Durable per-user credential row.
///
/// Written once on successful registration; `session_token` is the opaque
/// string the SDK exports after sign-in and is what makes a row eligible for
/// rehydration at boot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: UserId,
    pub api_id: i32,
    pub api_hash: String,
    pub session_token: Option<String>,
}

/// Ephemeral registration handshake state, one per user, TTL-bound.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingAuth {
    pub api_id: i32,
    pub api_hash: String,
    pub phone: String,
    pub code_challenge: String,
}

/// A user-defined classification target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    pub description: String,
}

impl Topic {
    /// The text the matcher encodes for this topic.
    pub fn embedding_text(&self) -> String {
        format!("{} {}", self.name, self.description)
    }
}

/// A raw message event as published to `message.process`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub telegram_message_id: MessageId,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub text: String,
    pub sender_username: Option<String>,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            user_id: self.user_id,
            chat_id: self.chat_id,
        }
    }
}

/// "This message matched this topic with this confidence."
///
/// Published once to `message.answer`; immutable after that.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyTask {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub telegram_message_id: MessageId,
    pub content: String,
    pub topic_id: TopicId,
    pub score: f32,
    pub sender_username: Option<String>,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
}

/// The (user, chat) pair that groups events into one batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub user_id: UserId,
    pub chat_id: ChatId,
}

/// An existing reply-thread an inbound message continues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadHit {
    pub thread_id: ThreadId,
    pub topic_id: TopicId,
}
