//! Port over the chat-network user-session SDK.
//!
//! The wire protocol is out of scope; this is the surface the relay needs
//! from whatever client library provides it: connect with stored
//! credentials, drive the login handshake, stream inbound messages, send.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::domain::{ChatId, MessageId, UserId};
use crate::Result;

/// Everything needed to open (or resume) one connection.
#[derive(Clone, Debug)]
pub struct ClientAuth {
    pub api_id: i32,
    pub api_hash: String,
    /// Previously exported session token; `None` for a fresh login.
    pub session_token: Option<String>,
}

/// Outcome of a code sign-in attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignIn {
    Complete,
    /// The account has a second factor; `sign_in_with_password` must follow.
    PasswordRequired,
}

/// One inbound message event as the SDK reports it.
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingEvent {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: String,
    pub sender_id: UserId,
    pub sender_username: Option<String>,
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

/// Connection factory.
#[async_trait]
pub trait ChatNetwork: Send + Sync {
    async fn connect(&self, auth: ClientAuth) -> Result<Box<dyn ChatHandle>>;
}

/// One live connection. Exclusively owned by its session or pending login.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    /// Whether the stored token still authenticates this connection.
    async fn is_authorized(&self) -> Result<bool>;

    fn is_connected(&self) -> bool;

    /// Request a login code for `phone`; returns the code challenge token
    /// the subsequent sign-in must echo.
    async fn request_login_code(&self, phone: &str) -> Result<String>;

    async fn sign_in_with_code(&self, phone: &str, code: &str, challenge: &str) -> Result<SignIn>;

    async fn sign_in_with_password(&self, password: &str) -> Result<()>;

    /// Export the session token to persist for later resumption.
    async fn export_session(&self) -> Result<String>;

    /// Stream of inbound message events. At most one subscriber.
    async fn incoming(&self) -> Result<mpsc::UnboundedReceiver<IncomingEvent>>;

    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId>;

    /// Close the connection. Safe to call more than once.
    async fn disconnect(&self);
}
