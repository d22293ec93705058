//! In-memory map of live sessions; the source of truth for "is this user's
//! relay running".

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info};

use rdr_core::bus::MessageBus;
use rdr_core::domain::UserId;
use rdr_core::net::ChatNetwork;
use rdr_core::store::{ChatDirectory, CredentialStore, ThreadIndex};
use rdr_core::{Error, Result};

use crate::session::ClientSession;

pub struct SessionRegistry {
    network: Arc<dyn ChatNetwork>,
    credentials: Arc<dyn CredentialStore>,
    chats: Arc<dyn ChatDirectory>,
    threads: Arc<dyn ThreadIndex>,
    bus: Arc<dyn MessageBus>,
    refresh_interval: Duration,
    sessions: Mutex<HashMap<UserId, Arc<ClientSession>>>,
}

impl SessionRegistry {
    pub fn new(
        network: Arc<dyn ChatNetwork>,
        credentials: Arc<dyn CredentialStore>,
        chats: Arc<dyn ChatDirectory>,
        threads: Arc<dyn ThreadIndex>,
        bus: Arc<dyn MessageBus>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            network,
            credentials,
            chats,
            threads,
            bus,
            refresh_interval,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a session for a registered user.
    ///
    /// Idempotent-rejecting: an existing session is returned as-is rather
    /// than opening a second connection. The map lock is never held across
    /// the handshake; the loser of a concurrent start tears its connection
    /// down and returns the winner's session. A failed start leaves no
    /// registry entry behind.
    pub async fn start(&self, user_id: UserId) -> Result<Arc<ClientSession>> {
        if let Some(existing) = self.sessions.lock().get(&user_id) {
            return Ok(existing.clone());
        }

        let credential = self
            .credentials
            .get(user_id)
            .await?
            .ok_or_else(|| Error::DatabaseNotFound(format!("credential for user {user_id}")))?;

        let session = ClientSession::connect(
            self.network.as_ref(),
            &credential,
            self.bus.clone(),
            self.chats.clone(),
            self.threads.clone(),
            self.refresh_interval,
        )
        .await?;

        if let Err(e) = session.start().await {
            session.stop().await;
            return Err(e);
        }

        let raced = {
            let mut sessions = self.sessions.lock();
            match sessions.entry(user_id) {
                Entry::Occupied(entry) => Some(entry.get().clone()),
                Entry::Vacant(entry) => {
                    entry.insert(session.clone());
                    None
                }
            }
        };
        if let Some(existing) = raced {
            session.stop().await;
            return Ok(existing);
        }

        info!(user_id = %user_id, "client_started");
        Ok(session)
    }

    /// Stop and forget a user's session.
    ///
    /// The entry is removed before the connection is released so a
    /// concurrent `get` never observes a half-torn-down session.
    pub async fn stop(&self, user_id: UserId) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .remove(&user_id)
            .ok_or(Error::ClientNotFound(user_id))?;
        session.stop().await;
        info!(user_id = %user_id, "client_stopped");
        Ok(())
    }

    pub fn get(&self, user_id: UserId) -> Option<Arc<ClientSession>> {
        self.sessions.lock().get(&user_id).cloned()
    }

    /// Snapshot of every live session, for the watchdog.
    pub fn sessions(&self) -> Vec<(UserId, Arc<ClientSession>)> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, session)| (*id, session.clone()))
            .collect()
    }

    /// Rehydrate every persisted credential that has a session token.
    /// One user's failure never blocks the others.
    pub async fn start_all(&self) -> Result<()> {
        for credential in self.credentials.all().await? {
            if credential.session_token.is_none() {
                continue;
            }
            if let Err(e) = self.start(credential.user_id).await {
                error!(user_id = %credential.user_id, error = %e, "client_start_failed");
            }
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.sessions.lock().drain().collect();
        for (user_id, session) in drained {
            session.stop().await;
            info!(user_id = %user_id, "client_stopped");
        }
    }
}
