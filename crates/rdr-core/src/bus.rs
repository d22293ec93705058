//! The broker boundary between services.
//!
//! The bus itself is external (durable pub/sub, at-least-once, manual ack);
//! this module pins down the queue names, the payload shapes and the port the
//! services consume. `memory::MemoryBus` is the in-process implementation
//! used by tests and the dev harness.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::{ChatId, InboundMessage, ThreadId, TopicId, UserId};
use crate::Result;

/// Every queue the core publishes to or consumes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Queue {
    RegistrationInit,
    RegistrationConfirm,
    RegistrationPassword,
    RegistrationStatus,
    ClientStart,
    ClientStop,
    ClientStatus,
    ClientError,
    MessageProcess,
    MessageThread,
    MessageAnswer,
    TopicInvalidate,
}

impl Queue {
    pub fn name(self) -> &'static str {
        match self {
            Queue::RegistrationInit => "registration.init",
            Queue::RegistrationConfirm => "registration.confirm",
            Queue::RegistrationPassword => "registration.password",
            Queue::RegistrationStatus => "registration.status",
            Queue::ClientStart => "client.start",
            Queue::ClientStop => "client.stop",
            Queue::ClientStatus => "client.status",
            Queue::ClientError => "client.error",
            Queue::MessageProcess => "message.process",
            Queue::MessageThread => "message.thread",
            Queue::MessageAnswer => "message.answer",
            Queue::TopicInvalidate => "topic.invalidate",
        }
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// === Payloads ===

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrationInit {
    pub user_id: UserId,
    pub phone: String,
    pub api_id: i32,
    pub api_hash: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrationConfirm {
    pub user_id: UserId,
    pub code: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrationPassword {
    pub user_id: UserId,
    pub password: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStage {
    CodeSent,
    PasswordRequired,
    Registered,
    Error,
}

/// Machine-readable failure codes carried inside `registration.status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationErrorCode {
    AuthDataExpired,
    InvalidCode,
    ChatApiError,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrationStatusError {
    pub code: RegistrationErrorCode,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrationStatus {
    pub user_id: UserId,
    pub status: RegistrationStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RegistrationStatusError>,
}

impl RegistrationStatus {
    pub fn stage(user_id: UserId, status: RegistrationStage) -> Self {
        Self {
            user_id,
            status,
            error: None,
        }
    }

    pub fn error(user_id: UserId, code: RegistrationErrorCode, message: impl Into<String>) -> Self {
        Self {
            user_id,
            status: RegistrationStage::Error,
            error: Some(RegistrationStatusError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// `client.start` / `client.stop` payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientControl {
    pub user_id: UserId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEvent {
    Disconnected,
    Reconnected,
    Unauthorized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStatus {
    pub user_id: UserId,
    pub event: ClientEvent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientError {
    pub user_id: UserId,
    pub error: String,
}

/// An inbound event the wrapper routed to an existing reply-thread.
///
/// Consumed by the external reply drafter; topic matching is skipped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    #[serde(flatten)]
    pub message: InboundMessage,
    pub thread_id: ThreadId,
    pub topic_id: TopicId,
}

/// `topic.invalidate` payload, published by the CRUD front end whenever a
/// topic or a chat's topic bindings change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInvalidate {
    pub user_id: UserId,
    pub chat_id: ChatId,
}

// === Port ===

/// One at-least-once delivery pulled from a queue.
///
/// Must be settled exactly once with `ack` or `nack`; dropping it unsettled
/// counts as a nack, mirroring what a broker does with a dead consumer.
pub struct Delivery {
    pub queue: Queue,
    pub body: Vec<u8>,
    pub redelivered: bool,
    settle: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl Delivery {
    pub fn new(
        queue: Queue,
        body: Vec<u8>,
        redelivered: bool,
        settle: impl FnOnce(bool) + Send + 'static,
    ) -> Self {
        Self {
            queue,
            body,
            redelivered,
            settle: Some(Box::new(settle)),
        }
    }

    pub fn ack(mut self) {
        if let Some(settle) = self.settle.take() {
            settle(true);
        }
    }

    pub fn nack(mut self) {
        if let Some(settle) = self.settle.take() {
            settle(false);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(settle) = self.settle.take() {
            settle(false);
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Port over the durable pub/sub transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, queue: Queue, body: Vec<u8>) -> Result<()>;

    /// Attach the (single) consumer for a queue.
    async fn subscribe(&self, queue: Queue) -> Result<mpsc::UnboundedReceiver<Delivery>>;
}

/// Typed publish helper; every payload on the bus is JSON.
#[async_trait]
pub trait MessageBusExt: MessageBus {
    async fn publish_json<T: Serialize + Sync>(&self, queue: Queue, message: &T) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        self.publish(queue, body).await
    }
}

impl<B: MessageBus + ?Sized> MessageBusExt for B {}

/// Subscribe `queue` and process JSON deliveries on a spawned task until
/// cancelled.
///
/// Undecodable payloads are acked and logged so they cannot loop; handler
/// errors nack the delivery and leave redelivery to the broker.
pub async fn spawn_consumer<T, H, Fut>(
    bus: std::sync::Arc<dyn MessageBus>,
    queue: Queue,
    cancel: tokio_util::sync::CancellationToken,
    handler: H,
) -> Result<()>
where
    T: serde::de::DeserializeOwned + Send + 'static,
    H: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    let mut rx = bus.subscribe(queue).await?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => {
                    let Some(delivery) = maybe else { break };
                    match serde_json::from_slice::<T>(&delivery.body) {
                        Err(e) => {
                            tracing::warn!(queue = %queue, error = %e, "dropping_undecodable_payload");
                            delivery.ack();
                        }
                        Ok(msg) => match handler(msg).await {
                            Ok(()) => delivery.ack(),
                            Err(e) => {
                                tracing::error!(queue = %queue, error = %e, "handler_failed");
                                delivery.nack();
                            }
                        },
                    }
                }
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_status_error_shape() {
        let status = RegistrationStatus::error(
            UserId(7),
            RegistrationErrorCode::AuthDataExpired,
            "authentication data has expired",
        );
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["code"], "AUTH_DATA_EXPIRED");
    }

    #[test]
    fn registration_status_omits_absent_error() {
        let status = RegistrationStatus::stage(UserId(7), RegistrationStage::CodeSent);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "code_sent");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn thread_message_flattens_inbound_fields() {
        let msg = ThreadMessage {
            message: InboundMessage {
                telegram_message_id: crate::domain::MessageId(3),
                user_id: UserId(1),
                chat_id: ChatId(-100),
                text: "still broken".into(),
                sender_username: Some("alice".into()),
                sender_id: UserId(42),
                created_at: chrono::Utc::now(),
            },
            thread_id: ThreadId(9),
            topic_id: TopicId(2),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["chat_id"], -100);
        assert_eq!(json["thread_id"], 9);
        assert_eq!(json["topic_id"], 2);
    }
}
