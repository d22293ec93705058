//! Registration handshake: send-code → confirm-code → optional password →
//! persisted credential.
//!
//! Each pending login owns a temporary connection and a TTL-bound auth
//! entry; the expiry task force-disconnects the connection when the TTL
//! lapses, whatever state the flow is in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use rdr_core::bus::{
    MessageBus, MessageBusExt, Queue, RegistrationConfirm, RegistrationErrorCode,
    RegistrationInit, RegistrationPassword, RegistrationStage, RegistrationStatus,
};
use rdr_core::domain::{Credential, PendingAuth, UserId};
use rdr_core::net::{ChatHandle, ChatNetwork, ClientAuth, SignIn};
use rdr_core::store::CredentialStore;
use rdr_core::{Error, Result};

/// Outcome of a confirm step that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Registered,
    PasswordRequired,
}

struct PendingLogin {
    handle: Arc<dyn ChatHandle>,
    auth: PendingAuth,
    deadline: Instant,
}

pub struct RegistrationFlow {
    network: Arc<dyn ChatNetwork>,
    bus: Arc<dyn MessageBus>,
    credentials: Arc<dyn CredentialStore>,
    ttl: Duration,
    pending: Mutex<HashMap<UserId, PendingLogin>>,
}

impl RegistrationFlow {
    pub fn new(
        network: Arc<dyn ChatNetwork>,
        bus: Arc<dyn MessageBus>,
        credentials: Arc<dyn CredentialStore>,
        ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            network,
            bus,
            credentials,
            ttl,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Open a temporary connection, request a login code and store the
    /// pending auth entry. A previous pending login for the same user is
    /// replaced and its connection closed.
    pub async fn send_code(self: &Arc<Self>, init: RegistrationInit) -> Result<()> {
        let user_id = init.user_id;
        info!(user_id = %user_id, "sending_verification_code");

        let handle: Arc<dyn ChatHandle> = match self
            .network
            .connect(ClientAuth {
                api_id: init.api_id,
                api_hash: init.api_hash.clone(),
                session_token: None,
            })
            .await
        {
            Ok(handle) => Arc::from(handle),
            Err(e) => {
                self.publish_error(user_id, RegistrationErrorCode::ChatApiError, &e)
                    .await;
                return Err(e);
            }
        };

        let challenge = match handle.request_login_code(&init.phone).await {
            Ok(challenge) => challenge,
            Err(e) => {
                handle.disconnect().await;
                self.publish_error(user_id, RegistrationErrorCode::ChatApiError, &e)
                    .await;
                return Err(e);
            }
        };

        self.publish_stage(user_id, RegistrationStage::CodeSent)
            .await?;

        let entry = PendingLogin {
            handle: handle.clone(),
            auth: PendingAuth {
                api_id: init.api_id,
                api_hash: init.api_hash,
                phone: init.phone,
                code_challenge: challenge,
            },
            deadline: Instant::now() + self.ttl,
        };
        let previous = self.pending.lock().insert(user_id, entry);
        if let Some(previous) = previous {
            previous.handle.disconnect().await;
        }

        self.spawn_expiry(user_id);
        info!(user_id = %user_id, "auth_data_stored");
        Ok(())
    }

    /// Confirm the login code. Returns `PasswordRequired` when the account
    /// has a second factor, in which case the pending entry stays alive for
    /// `confirm_password`.
    pub async fn confirm_code(&self, confirm: RegistrationConfirm) -> Result<ConfirmOutcome> {
        let user_id = confirm.user_id;
        info!(user_id = %user_id, "confirming_code");

        let Some((handle, auth)) = self.lookup(user_id) else {
            return self.expired(user_id).await;
        };

        match handle
            .sign_in_with_code(&auth.phone, &confirm.code, &auth.code_challenge)
            .await
        {
            Ok(SignIn::Complete) => {
                self.complete(user_id, handle.as_ref(), &auth).await?;
                Ok(ConfirmOutcome::Registered)
            }
            Ok(SignIn::PasswordRequired) => {
                info!(user_id = %user_id, "password_required");
                self.publish_stage(user_id, RegistrationStage::PasswordRequired)
                    .await?;
                Ok(ConfirmOutcome::PasswordRequired)
            }
            Err(e) => {
                self.publish_error(user_id, RegistrationErrorCode::InvalidCode, &e)
                    .await;
                Err(e)
            }
        }
    }

    /// Confirm the second factor and finish the registration.
    pub async fn confirm_password(&self, confirm: RegistrationPassword) -> Result<ConfirmOutcome> {
        let user_id = confirm.user_id;
        info!(user_id = %user_id, "confirming_password");

        let Some((handle, auth)) = self.lookup(user_id) else {
            return self.expired(user_id).await;
        };

        if let Err(e) = handle.sign_in_with_password(&confirm.password).await {
            handle.disconnect().await;
            self.pending.lock().remove(&user_id);
            self.publish_error(user_id, RegistrationErrorCode::ChatApiError, &e)
                .await;
            return Err(e);
        }

        self.complete(user_id, handle.as_ref(), &auth).await?;
        Ok(ConfirmOutcome::Registered)
    }

    fn lookup(&self, user_id: UserId) -> Option<(Arc<dyn ChatHandle>, PendingAuth)> {
        let pending = self.pending.lock();
        let entry = pending.get(&user_id)?;
        if entry.deadline <= Instant::now() {
            // Lapsed but not yet swept; the expiry task will disconnect it.
            return None;
        }
        Some((entry.handle.clone(), entry.auth.clone()))
    }

    async fn expired(&self, user_id: UserId) -> Result<ConfirmOutcome> {
        warn!(user_id = %user_id, "auth_data_expired");
        let status = RegistrationStatus::error(
            user_id,
            RegistrationErrorCode::AuthDataExpired,
            "authentication data has expired, please restart registration",
        );
        self.bus
            .publish_json(Queue::RegistrationStatus, &status)
            .await?;
        Err(Error::AuthDataExpired(user_id))
    }

    async fn complete(&self, user_id: UserId, handle: &dyn ChatHandle, auth: &PendingAuth) -> Result<()> {
        let token = handle.export_session().await?;
        self.credentials
            .upsert(Credential {
                user_id,
                api_id: auth.api_id,
                api_hash: auth.api_hash.clone(),
                session_token: Some(token),
            })
            .await?;

        handle.disconnect().await;
        self.pending.lock().remove(&user_id);
        info!(user_id = %user_id, "registration_completed");

        self.publish_stage(user_id, RegistrationStage::Registered)
            .await
    }

    fn spawn_expiry(self: &Arc<Self>, user_id: UserId) {
        let flow = self.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            sleep(ttl).await;
            flow.sweep_expired(user_id).await;
        });
    }

    /// Drop the pending entry if its deadline has lapsed and force-close the
    /// temporary connection. A `send_code` that replaced the entry moved the
    /// deadline forward, so only the newest expiry task sweeps it.
    async fn sweep_expired(&self, user_id: UserId) {
        let entry = {
            let mut pending = self.pending.lock();
            match pending.get(&user_id) {
                Some(entry) if entry.deadline <= Instant::now() => pending.remove(&user_id),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            warn!(user_id = %user_id, "registration_expired");
            entry.handle.disconnect().await;
        }
    }

    async fn publish_stage(&self, user_id: UserId, stage: RegistrationStage) -> Result<()> {
        self.bus
            .publish_json(
                Queue::RegistrationStatus,
                &RegistrationStatus::stage(user_id, stage),
            )
            .await
    }

    async fn publish_error(&self, user_id: UserId, code: RegistrationErrorCode, error: &Error) {
        let status = RegistrationStatus::error(user_id, code, error.to_string());
        if let Err(e) = self
            .bus
            .publish_json(Queue::RegistrationStatus, &status)
            .await
        {
            warn!(user_id = %user_id, error = %e, "status_publish_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdr_core::memory::{MemoryBus, MemoryStore, SimNetwork};
    use tokio::sync::mpsc::UnboundedReceiver;
    use rdr_core::bus::Delivery;

    struct Fixture {
        net: SimNetwork,
        store: Arc<MemoryStore>,
        status_rx: UnboundedReceiver<Delivery>,
        flow: Arc<RegistrationFlow>,
    }

    async fn fixture(ttl: Duration) -> Fixture {
        let net = SimNetwork::new();
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let status_rx = bus.subscribe(Queue::RegistrationStatus).await.unwrap();
        let flow = RegistrationFlow::new(
            Arc::new(net.clone()),
            Arc::new(bus.clone()),
            store.clone(),
            ttl,
        );
        Fixture {
            net,
            store,
            status_rx,
            flow,
        }
    }

    fn init(user_id: i64, phone: &str) -> RegistrationInit {
        RegistrationInit {
            user_id: UserId(user_id),
            phone: phone.to_string(),
            api_id: 11,
            api_hash: "hash".to_string(),
        }
    }

    async fn next_status(rx: &mut UnboundedReceiver<Delivery>) -> RegistrationStatus {
        let delivery = rx.recv().await.unwrap();
        let status = serde_json::from_slice(&delivery.body).unwrap();
        delivery.ack();
        status
    }

    #[tokio::test]
    async fn code_only_flow_persists_credential() {
        let mut fx = fixture(Duration::from_secs(300)).await;

        fx.flow.send_code(init(1, "+100")).await.unwrap();
        assert_eq!(
            next_status(&mut fx.status_rx).await.status,
            RegistrationStage::CodeSent
        );

        let outcome = fx
            .flow
            .confirm_code(RegistrationConfirm {
                user_id: UserId(1),
                code: "12345".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmOutcome::Registered);
        assert_eq!(
            next_status(&mut fx.status_rx).await.status,
            RegistrationStage::Registered
        );

        let credential = fx.store.get(UserId(1)).await.unwrap().unwrap();
        assert_eq!(credential.session_token.as_deref(), Some("token-+100"));
        // Temporary connection is gone.
        assert!(!fx.net.last_handle().unwrap().is_connected());
    }

    #[tokio::test]
    async fn second_factor_flow_goes_through_password() {
        let mut fx = fixture(Duration::from_secs(300)).await;
        fx.net.require_password("+200");

        fx.flow.send_code(init(2, "+200")).await.unwrap();
        assert_eq!(
            next_status(&mut fx.status_rx).await.status,
            RegistrationStage::CodeSent
        );

        let outcome = fx
            .flow
            .confirm_code(RegistrationConfirm {
                user_id: UserId(2),
                code: "12345".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmOutcome::PasswordRequired);
        assert_eq!(
            next_status(&mut fx.status_rx).await.status,
            RegistrationStage::PasswordRequired
        );

        let outcome = fx
            .flow
            .confirm_password(RegistrationPassword {
                user_id: UserId(2),
                password: "hunter2".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmOutcome::Registered);
        assert_eq!(
            next_status(&mut fx.status_rx).await.status,
            RegistrationStage::Registered
        );
        assert!(fx.store.get(UserId(2)).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_after_ttl_is_auth_data_expired() {
        let mut fx = fixture(Duration::from_secs(300)).await;

        fx.flow.send_code(init(3, "+300")).await.unwrap();
        let _ = next_status(&mut fx.status_rx).await;

        tokio::time::advance(Duration::from_secs(301)).await;
        // Let the expiry task run.
        tokio::task::yield_now().await;

        let err = fx
            .flow
            .confirm_code(RegistrationConfirm {
                user_id: UserId(3),
                code: "12345".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthDataExpired(UserId(3))));

        let status = next_status(&mut fx.status_rx).await;
        assert_eq!(status.status, RegistrationStage::Error);
        assert_eq!(
            status.error.unwrap().code,
            RegistrationErrorCode::AuthDataExpired
        );
        // The temporary connection was force-closed at expiry.
        assert!(!fx.net.last_handle().unwrap().is_connected());
    }

    #[tokio::test]
    async fn confirm_without_send_code_is_auth_data_expired() {
        let mut fx = fixture(Duration::from_secs(300)).await;

        let err = fx
            .flow
            .confirm_code(RegistrationConfirm {
                user_id: UserId(9),
                code: "12345".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthDataExpired(UserId(9))));
        assert_eq!(
            next_status(&mut fx.status_rx).await.status,
            RegistrationStage::Error
        );
    }

    #[tokio::test]
    async fn resending_code_replaces_pending_and_disconnects_old() {
        let mut fx = fixture(Duration::from_secs(300)).await;

        fx.flow.send_code(init(4, "+400")).await.unwrap();
        let _ = next_status(&mut fx.status_rx).await;
        fx.flow.send_code(init(4, "+400")).await.unwrap();
        let _ = next_status(&mut fx.status_rx).await;

        let handles = fx.net.handles();
        assert_eq!(handles.len(), 2);
        assert!(!handles[0].is_connected());
        assert!(handles[1].is_connected());
    }

    #[tokio::test]
    async fn invalid_code_publishes_error_and_keeps_pending() {
        let mut fx = fixture(Duration::from_secs(300)).await;
        fx.net.reject_code("badcode");

        fx.flow.send_code(init(5, "+500")).await.unwrap();
        let _ = next_status(&mut fx.status_rx).await;

        let err = fx
            .flow
            .confirm_code(RegistrationConfirm {
                user_id: UserId(5),
                code: "badcode".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolClient(_)));
        let status = next_status(&mut fx.status_rx).await;
        assert_eq!(
            status.error.unwrap().code,
            RegistrationErrorCode::InvalidCode
        );

        // A good retry within the TTL still succeeds.
        let outcome = fx
            .flow
            .confirm_code(RegistrationConfirm {
                user_id: UserId(5),
                code: "goodcode".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmOutcome::Registered);
    }
}
