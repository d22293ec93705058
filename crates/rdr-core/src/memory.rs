//! In-process adapters: bus, store and a scriptable chat network.
//!
//! These back the dev harness binary and the test suites. Real deployments
//! substitute a broker adapter, the relational store and the SDK adapter
//! behind the same ports.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::bus::{Delivery, MessageBus, Queue};
use crate::domain::{ChatId, Credential, MessageId, ReplyTask, ThreadHit, Topic, UserId};
use crate::draft::ReplyDrafter;
use crate::net::{ChatHandle, ChatNetwork, ClientAuth, IncomingEvent, SignIn};
use crate::store::{ChatDirectory, CredentialStore, ThreadIndex, TopicDirectory};
use crate::{Error, Result};

// === Bus ===

/// In-process `MessageBus` with at-least-once semantics: a nacked (or
/// dropped-unsettled) delivery is redelivered once, then dead-lettered.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    queues: Mutex<HashMap<Queue, QueueState>>,
}

struct QueueState {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BusInner {
    fn enqueue(self: &Arc<Self>, queue: Queue, body: Vec<u8>, redelivered: bool) -> Result<()> {
        let weak = Arc::downgrade(self);
        let redelivery_body = body.clone();
        let delivery = Delivery::new(queue, body, redelivered, move |acked| {
            if acked {
                return;
            }
            Self::settle_nack(&weak, queue, redelivery_body, redelivered);
        });

        let mut queues = self.queues.lock();
        let state = queues.entry(queue).or_insert_with(new_queue_state);
        state
            .tx
            .send(delivery)
            .map_err(|_| Error::Broker(format!("queue {queue} has no live consumer")))
    }

    fn settle_nack(weak: &Weak<Self>, queue: Queue, body: Vec<u8>, redelivered: bool) {
        if redelivered {
            warn!(queue = %queue, "dead-lettering delivery after second nack");
            return;
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.enqueue(queue, body, true).is_err() {
            warn!(queue = %queue, "redelivery failed, consumer is gone");
        }
    }
}

fn new_queue_state() -> QueueState {
    let (tx, rx) = mpsc::unbounded_channel();
    QueueState { tx, rx: Some(rx) }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, queue: Queue, body: Vec<u8>) -> Result<()> {
        self.inner.enqueue(queue, body, false)
    }

    async fn subscribe(&self, queue: Queue) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        let mut queues = self.inner.queues.lock();
        let state = queues.entry(queue).or_insert_with(new_queue_state);
        state
            .rx
            .take()
            .ok_or_else(|| Error::Broker(format!("queue {queue} already has a consumer")))
    }
}

// === Store ===

/// In-memory implementation of every collaborator port.
#[derive(Default)]
pub struct MemoryStore {
    credentials: Mutex<HashMap<UserId, Credential>>,
    chats: Mutex<HashMap<UserId, Vec<ChatId>>>,
    topics: Mutex<HashMap<(UserId, ChatId), Vec<Topic>>>,
    threads: Mutex<HashMap<(UserId, ChatId, MessageId), ThreadHit>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_credential(&self, credential: Credential) {
        self.credentials
            .lock()
            .insert(credential.user_id, credential);
    }

    pub fn set_active_chats(&self, user_id: UserId, chat_ids: Vec<ChatId>) {
        self.chats.lock().insert(user_id, chat_ids);
    }

    pub fn set_topics(&self, user_id: UserId, chat_id: ChatId, topics: Vec<Topic>) {
        self.topics.lock().insert((user_id, chat_id), topics);
    }

    pub fn link_thread(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        message_id: MessageId,
        hit: ThreadHit,
    ) {
        self.threads
            .lock()
            .insert((user_id, chat_id, message_id), hit);
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, user_id: UserId) -> Result<Option<Credential>> {
        Ok(self.credentials.lock().get(&user_id).cloned())
    }

    async fn all(&self) -> Result<Vec<Credential>> {
        Ok(self.credentials.lock().values().cloned().collect())
    }

    async fn upsert(&self, credential: Credential) -> Result<()> {
        self.insert_credential(credential);
        Ok(())
    }
}

#[async_trait]
impl ChatDirectory for MemoryStore {
    async fn active_chat_ids(&self, user_id: UserId) -> Result<Vec<ChatId>> {
        Ok(self.chats.lock().get(&user_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl TopicDirectory for MemoryStore {
    async fn topics(&self, user_id: UserId, chat_id: ChatId) -> Result<Vec<Topic>> {
        Ok(self
            .topics
            .lock()
            .get(&(user_id, chat_id))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ThreadIndex for MemoryStore {
    async fn thread_for_message(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<ThreadHit>> {
        Ok(self
            .threads
            .lock()
            .get(&(user_id, chat_id, message_id))
            .copied())
    }
}

// === Reply drafter ===

/// Drafter that interpolates a fixed template: `{topic}` expands to the
/// matched topic id, `{text}` to the original message text.
pub struct TemplateDrafter {
    template: String,
}

impl TemplateDrafter {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl ReplyDrafter for TemplateDrafter {
    async fn draft(&self, task: &ReplyTask) -> Result<String> {
        Ok(self
            .template
            .replace("{topic}", &task.topic_id.to_string())
            .replace("{text}", &task.content))
    }
}

// === Chat network ===

/// Scriptable `ChatNetwork`: tests and the dev harness drive connections,
/// inject inbound events and inspect outbound sends through `SimHandle`.
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<SimNetInner>,
}

#[derive(Default)]
struct SimNetInner {
    handles: Mutex<Vec<Arc<SimHandleInner>>>,
    password_phones: Mutex<HashSet<String>>,
    invalid_codes: Mutex<HashSet<String>>,
    revoked_tokens: Mutex<HashSet<String>>,
    challenge_counter: AtomicU64,
}

struct SimHandleInner {
    net: Weak<SimNetInner>,
    connected: AtomicBool,
    authorized: AtomicBool,
    issued_challenge: Mutex<Option<String>>,
    signed_in_phone: Mutex<Option<String>>,
    password_pending: AtomicBool,
    events_tx: mpsc::UnboundedSender<IncomingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingEvent>>>,
    sent: Mutex<Vec<SentMessage>>,
    next_message_id: AtomicI32,
}

/// One outbound send recorded by the simulated network.
#[derive(Clone, Debug, PartialEq)]
pub struct SentMessage {
    pub chat_id: ChatId,
    pub text: String,
    pub reply_to: Option<MessageId>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts for this phone require the second factor during sign-in.
    pub fn require_password(&self, phone: &str) {
        self.inner.password_phones.lock().insert(phone.to_string());
    }

    /// Sign-ins presenting this code will fail.
    pub fn reject_code(&self, code: &str) {
        self.inner.invalid_codes.lock().insert(code.to_string());
    }

    /// Connections resuming this token will come up unauthorized.
    pub fn revoke_token(&self, token: &str) {
        self.inner.revoked_tokens.lock().insert(token.to_string());
    }

    /// Control handles for every connection opened so far, in order.
    pub fn handles(&self) -> Vec<SimHandle> {
        self.inner
            .handles
            .lock()
            .iter()
            .cloned()
            .map(SimHandle)
            .collect()
    }

    pub fn last_handle(&self) -> Option<SimHandle> {
        self.inner.handles.lock().last().cloned().map(SimHandle)
    }
}

#[async_trait]
impl ChatNetwork for SimNetwork {
    async fn connect(&self, auth: ClientAuth) -> Result<Box<dyn ChatHandle>> {
        let authorized = match &auth.session_token {
            Some(token) => !self.inner.revoked_tokens.lock().contains(token),
            None => false,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SimHandleInner {
            net: Arc::downgrade(&self.inner),
            connected: AtomicBool::new(true),
            authorized: AtomicBool::new(authorized),
            issued_challenge: Mutex::new(None),
            signed_in_phone: Mutex::new(None),
            password_pending: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            sent: Mutex::new(Vec::new()),
            next_message_id: AtomicI32::new(1000),
        });

        self.inner.handles.lock().push(handle.clone());
        Ok(Box::new(SimChatHandle(handle)))
    }
}

struct SimChatHandle(Arc<SimHandleInner>);

#[async_trait]
impl ChatHandle for SimChatHandle {
    async fn is_authorized(&self) -> Result<bool> {
        Ok(self.0.authorized.load(Ordering::SeqCst))
    }

    fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }

    async fn request_login_code(&self, _phone: &str) -> Result<String> {
        if !self.is_connected() {
            return Err(Error::ProtocolClient("connection is closed".to_string()));
        }
        let net = self.upgrade()?;
        let n = net.challenge_counter.fetch_add(1, Ordering::SeqCst);
        let challenge = format!("challenge-{n}");
        *self.0.issued_challenge.lock() = Some(challenge.clone());
        Ok(challenge)
    }

    async fn sign_in_with_code(&self, phone: &str, code: &str, challenge: &str) -> Result<SignIn> {
        if !self.is_connected() {
            return Err(Error::ProtocolClient("connection is closed".to_string()));
        }
        let net = self.upgrade()?;

        if self.0.issued_challenge.lock().as_deref() != Some(challenge) {
            return Err(Error::ProtocolClient("unknown code challenge".to_string()));
        }
        if net.invalid_codes.lock().contains(code) {
            return Err(Error::ProtocolClient("invalid login code".to_string()));
        }
        if net.password_phones.lock().contains(phone) {
            self.0.password_pending.store(true, Ordering::SeqCst);
            *self.0.signed_in_phone.lock() = Some(phone.to_string());
            return Ok(SignIn::PasswordRequired);
        }

        self.0.authorized.store(true, Ordering::SeqCst);
        *self.0.signed_in_phone.lock() = Some(phone.to_string());
        Ok(SignIn::Complete)
    }

    async fn sign_in_with_password(&self, _password: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ProtocolClient("connection is closed".to_string()));
        }
        if !self.0.password_pending.swap(false, Ordering::SeqCst) {
            return Err(Error::ProtocolClient(
                "no password sign-in pending".to_string(),
            ));
        }
        self.0.authorized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn export_session(&self) -> Result<String> {
        let phone = self.0.signed_in_phone.lock().clone();
        match phone {
            Some(phone) => Ok(format!("token-{phone}")),
            None => Err(Error::ProtocolClient("not signed in".to_string())),
        }
    }

    async fn incoming(&self) -> Result<mpsc::UnboundedReceiver<IncomingEvent>> {
        self.0
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| Error::ProtocolClient("incoming stream already taken".to_string()))
    }

    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        if !self.is_connected() {
            return Err(Error::ProtocolClient("connection is closed".to_string()));
        }
        self.0.sent.lock().push(SentMessage {
            chat_id,
            text: text.to_string(),
            reply_to,
        });
        Ok(MessageId(self.0.next_message_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn disconnect(&self) {
        self.0.connected.store(false, Ordering::SeqCst);
    }
}

impl SimChatHandle {
    fn upgrade(&self) -> Result<Arc<SimNetInner>> {
        self.0
            .net
            .upgrade()
            .ok_or_else(|| Error::ProtocolClient("network is gone".to_string()))
    }
}

/// Test-side control surface for one simulated connection.
#[derive(Clone)]
pub struct SimHandle(Arc<SimHandleInner>);

impl SimHandle {
    /// Inject an inbound message event as if the network delivered it.
    pub fn emit(&self, event: IncomingEvent) {
        let _ = self.0.events_tx.send(event);
    }

    /// Simulate the transport dropping (watchdog sees `is_connected` false).
    pub fn drop_connection(&self) {
        self.0.connected.store(false, Ordering::SeqCst);
    }

    pub fn restore_connection(&self) {
        self.0.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.0.sent.lock().clone()
    }
}
