//! Connection-health supervision: polls every live session and reports
//! disconnect/reconnect transitions exactly once each.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rdr_core::bus::{ClientEvent, ClientStatus, MessageBus, MessageBusExt, Queue};
use rdr_core::domain::UserId;
use rdr_core::Result;

use crate::registry::SessionRegistry;
use crate::session::ClientSession;

pub struct Watchdog {
    registry: Arc<SessionRegistry>,
    bus: Arc<dyn MessageBus>,
    check_interval: Duration,
}

impl Watchdog {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bus: Arc<dyn MessageBus>,
        check_interval: Duration,
    ) -> Self {
        Self {
            registry,
            bus,
            check_interval,
        }
    }

    /// Poll forever at the configured interval until cancelled.
    ///
    /// A per-session check failure is logged and skipped for that tick; it
    /// never aborts supervision of the other sessions or the loop itself.
    pub async fn run(self, cancel: CancellationToken) {
        info!(check_interval = ?self.check_interval, "watchdog_started");
        let mut disconnected: HashSet<UserId> = HashSet::new();
        let mut tick = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.check_sessions(&mut disconnected).await,
            }
        }
    }

    async fn check_sessions(&self, disconnected: &mut HashSet<UserId>) {
        for (user_id, session) in self.registry.sessions() {
            if let Err(e) = self.check_one(user_id, &session, disconnected).await {
                error!(user_id = %user_id, error = %e, "client_check_error");
            }
        }
    }

    async fn check_one(
        &self,
        user_id: UserId,
        session: &ClientSession,
        disconnected: &mut HashSet<UserId>,
    ) -> Result<()> {
        if !session.is_connected() {
            if !disconnected.contains(&user_id) {
                warn!(user_id = %user_id, "client_disconnected");
                self.publish(user_id, ClientEvent::Disconnected).await?;
                disconnected.insert(user_id);
            }
        } else if disconnected.contains(&user_id) {
            info!(user_id = %user_id, "client_reconnected");
            self.publish(user_id, ClientEvent::Reconnected).await?;
            disconnected.remove(&user_id);
        }
        Ok(())
    }

    async fn publish(&self, user_id: UserId, event: ClientEvent) -> Result<()> {
        self.bus
            .publish_json(Queue::ClientStatus, &ClientStatus { user_id, event })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdr_core::domain::{ChatId, Credential};
    use rdr_core::memory::{MemoryBus, MemoryStore, SimNetwork};

    async fn setup() -> (SimNetwork, Arc<SessionRegistry>, MemoryBus) {
        let net = SimNetwork::new();
        let store = Arc::new(MemoryStore::new());
        store.insert_credential(Credential {
            user_id: UserId(1),
            api_id: 11,
            api_hash: "hash".to_string(),
            session_token: Some("tok".to_string()),
        });
        store.set_active_chats(UserId(1), vec![ChatId(-10)]);
        let bus = MemoryBus::new();
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(net.clone()),
            store.clone(),
            store.clone(),
            store,
            Arc::new(bus.clone()),
            Duration::from_secs(60),
        ));
        registry.start(UserId(1)).await.unwrap();
        (net, registry, bus)
    }

    #[tokio::test]
    async fn one_event_per_transition_regardless_of_poll_count() {
        let (net, registry, bus) = setup().await;
        let mut status_rx = bus.subscribe(Queue::ClientStatus).await.unwrap();
        let watchdog = Watchdog::new(registry, Arc::new(bus), Duration::from_secs(10));
        let handle = net.last_handle().unwrap();
        let mut disconnected = HashSet::new();

        // Healthy ticks emit nothing.
        watchdog.check_sessions(&mut disconnected).await;
        watchdog.check_sessions(&mut disconnected).await;
        assert!(status_rx.try_recv().is_err());

        handle.drop_connection();
        watchdog.check_sessions(&mut disconnected).await;
        watchdog.check_sessions(&mut disconnected).await;
        watchdog.check_sessions(&mut disconnected).await;

        handle.restore_connection();
        watchdog.check_sessions(&mut disconnected).await;
        watchdog.check_sessions(&mut disconnected).await;

        let first = status_rx.recv().await.unwrap();
        let status: ClientStatus = serde_json::from_slice(&first.body).unwrap();
        assert_eq!(status.event, ClientEvent::Disconnected);
        first.ack();

        let second = status_rx.recv().await.unwrap();
        let status: ClientStatus = serde_json::from_slice(&second.body).unwrap();
        assert_eq!(status.event, ClientEvent::Reconnected);
        second.ack();

        assert!(status_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_publish_retries_on_the_next_tick() {
        let (net, registry, bus) = setup().await;
        let watchdog = Watchdog::new(registry, Arc::new(bus.clone()), Duration::from_secs(10));
        let handle = net.last_handle().unwrap();
        let mut disconnected = HashSet::new();

        // Take and drop the consumer so publishes fail.
        let status_rx = bus.subscribe(Queue::ClientStatus).await.unwrap();
        drop(status_rx);

        handle.drop_connection();
        watchdog.check_sessions(&mut disconnected).await;
        // The failed emission must not have recorded the transition.
        assert!(!disconnected.contains(&UserId(1)));
    }
}
