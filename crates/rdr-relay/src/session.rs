//! One live session: a connected client plus its background loops.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use rdr_core::bus::{ClientEvent, ClientStatus, MessageBus, MessageBusExt, Queue, ThreadMessage};
use rdr_core::domain::{ChatId, Credential, InboundMessage, MessageId, UserId};
use rdr_core::net::{ChatHandle, ChatNetwork, ClientAuth, IncomingEvent};
use rdr_core::store::{ChatDirectory, ThreadIndex};
use rdr_core::{Error, Result};

/// Wraps one authenticated connection for one user.
///
/// Filters inbound events to the allow-list of chat ids, classifies them
/// (thread continuation vs fresh) and publishes downstream; exposes outbound
/// send for the answer consumer.
pub struct ClientSession {
    user_id: UserId,
    handle: Arc<dyn ChatHandle>,
    allow_list: RwLock<HashSet<ChatId>>,
    cancel: CancellationToken,
    bus: Arc<dyn MessageBus>,
    chats: Arc<dyn ChatDirectory>,
    threads: Arc<dyn ThreadIndex>,
    refresh_interval: Duration,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("user_id", &self.user_id)
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Open the connection for a stored credential. The session is inert
    /// until `start` succeeds.
    pub async fn connect(
        network: &dyn ChatNetwork,
        credential: &Credential,
        bus: Arc<dyn MessageBus>,
        chats: Arc<dyn ChatDirectory>,
        threads: Arc<dyn ThreadIndex>,
        refresh_interval: Duration,
    ) -> Result<Arc<Self>> {
        let handle = network
            .connect(ClientAuth {
                api_id: credential.api_id,
                api_hash: credential.api_hash.clone(),
                session_token: credential.session_token.clone(),
            })
            .await?;

        Ok(Arc::new(Self {
            user_id: credential.user_id,
            handle: Arc::from(handle),
            allow_list: RwLock::new(HashSet::new()),
            cancel: CancellationToken::new(),
            bus,
            chats,
            threads,
            refresh_interval,
        }))
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Verify authorization, fill the allow-list and launch the event pump
    /// and the allow-list refresher.
    ///
    /// A stale token publishes `client.status {unauthorized}` and returns an
    /// error; the connection is closed and nothing keeps running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.handle.is_authorized().await? {
            self.bus
                .publish_json(
                    Queue::ClientStatus,
                    &ClientStatus {
                        user_id: self.user_id,
                        event: ClientEvent::Unauthorized,
                    },
                )
                .await?;
            self.handle.disconnect().await;
            return Err(Error::ProtocolClient(format!(
                "stored session token for user {} is no longer authorized",
                self.user_id
            )));
        }

        self.refresh_allow_list().await?;
        let mut events = self.handle.incoming().await?;

        let session = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    maybe = events.recv() => {
                        let Some(event) = maybe else { break };
                        if let Err(e) = session.handle_event(event).await {
                            error!(user_id = %session.user_id, error = %e, "event_handling_failed");
                        }
                    }
                }
            }
        });

        let session = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(session.refresh_interval);
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = session.refresh_allow_list().await {
                            warn!(user_id = %session.user_id, error = %e, "chat_list_refresh_failed");
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Classify one inbound event and publish it downstream.
    ///
    /// Events outside the allow-list are dropped silently. A reply to a
    /// message that belongs to a tracked reply-thread goes to
    /// `message.thread` (topic matching is skipped, the thread's topic is
    /// reused); everything else goes to `message.process`.
    pub async fn handle_event(&self, event: IncomingEvent) -> Result<()> {
        if !self.allow_list.read().contains(&event.chat_id) {
            return Ok(());
        }

        let message = InboundMessage {
            telegram_message_id: event.message_id,
            user_id: self.user_id,
            chat_id: event.chat_id,
            text: event.text,
            sender_username: event.sender_username,
            sender_id: event.sender_id,
            created_at: event.created_at,
        };

        if let Some(reply_to) = event.reply_to {
            let hit = self
                .threads
                .thread_for_message(self.user_id, message.chat_id, reply_to)
                .await?;
            if let Some(hit) = hit {
                debug!(
                    user_id = %self.user_id,
                    chat_id = %message.chat_id,
                    thread_id = %hit.thread_id,
                    "routing_to_thread"
                );
                return self
                    .bus
                    .publish_json(
                        Queue::MessageThread,
                        &ThreadMessage {
                            message,
                            thread_id: hit.thread_id,
                            topic_id: hit.topic_id,
                        },
                    )
                    .await;
            }
        }

        self.bus.publish_json(Queue::MessageProcess, &message).await
    }

    pub async fn send(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        self.handle.send_message(chat_id, text, reply_to).await
    }

    /// Cancel the background loops and close the connection. Safe to call
    /// more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.handle.disconnect().await;
    }

    async fn refresh_allow_list(&self) -> Result<()> {
        let chat_ids = self.chats.active_chat_ids(self.user_id).await?;
        *self.allow_list.write() = chat_ids.into_iter().collect();
        Ok(())
    }
}
