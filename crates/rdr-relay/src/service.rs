//! Queue consumers for the relay: registration, client control and answer
//! delivery. The handler set is explicit and built once at startup.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rdr_core::bus::{
    spawn_consumer, ClientControl, ClientError, MessageBus, MessageBusExt, Queue,
    RegistrationConfirm, RegistrationInit, RegistrationPassword,
};
use rdr_core::domain::ReplyTask;
use rdr_core::draft::ReplyDrafter;
use rdr_core::{Error, Result};

use crate::registration::RegistrationFlow;
use crate::registry::SessionRegistry;

pub struct RelayService {
    bus: Arc<dyn MessageBus>,
    registry: Arc<SessionRegistry>,
    registration: Arc<RegistrationFlow>,
    drafter: Arc<dyn ReplyDrafter>,
}

impl RelayService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<SessionRegistry>,
        registration: Arc<RegistrationFlow>,
        drafter: Arc<dyn ReplyDrafter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            registry,
            registration,
            drafter,
        })
    }

    /// Rehydrate persisted sessions, then attach one consumer task per
    /// queue. Returns once every consumer is subscribed.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.registry.start_all().await?;

        let svc = self.clone();
        spawn_consumer(
            self.bus.clone(),
            Queue::RegistrationInit,
            cancel.clone(),
            move |msg: RegistrationInit| {
                let svc = svc.clone();
                async move { svc.handle_registration_init(msg).await }
            },
        )
        .await?;

        let svc = self.clone();
        spawn_consumer(
            self.bus.clone(),
            Queue::RegistrationConfirm,
            cancel.clone(),
            move |msg: RegistrationConfirm| {
                let svc = svc.clone();
                async move { svc.handle_registration_confirm(msg).await }
            },
        )
        .await?;

        let svc = self.clone();
        spawn_consumer(
            self.bus.clone(),
            Queue::RegistrationPassword,
            cancel.clone(),
            move |msg: RegistrationPassword| {
                let svc = svc.clone();
                async move { svc.handle_registration_password(msg).await }
            },
        )
        .await?;

        let svc = self.clone();
        spawn_consumer(
            self.bus.clone(),
            Queue::ClientStart,
            cancel.clone(),
            move |msg: ClientControl| {
                let svc = svc.clone();
                async move { svc.handle_client_start(msg).await }
            },
        )
        .await?;

        let svc = self.clone();
        spawn_consumer(
            self.bus.clone(),
            Queue::ClientStop,
            cancel.clone(),
            move |msg: ClientControl| {
                let svc = svc.clone();
                async move { svc.handle_client_stop(msg).await }
            },
        )
        .await?;

        let svc = self.clone();
        spawn_consumer(
            self.bus.clone(),
            Queue::MessageAnswer,
            cancel.clone(),
            move |msg: ReplyTask| {
                let svc = svc.clone();
                async move { svc.handle_answer(msg).await }
            },
        )
        .await?;

        info!("relay_consumers_started");
        Ok(())
    }

    /// Drain the registry on shutdown.
    pub async fn shutdown(&self) {
        self.registry.stop_all().await;
    }

    // Registration errors are terminal for the attempt: the flow has already
    // published the status event, so the delivery is acked, not redelivered.
    async fn handle_registration_init(&self, msg: RegistrationInit) -> Result<()> {
        if let Err(e) = self.registration.send_code(msg).await {
            warn!(error = %e, "registration_init_failed");
        }
        Ok(())
    }

    async fn handle_registration_confirm(&self, msg: RegistrationConfirm) -> Result<()> {
        if let Err(e) = self.registration.confirm_code(msg).await {
            warn!(error = %e, "registration_confirm_failed");
        }
        Ok(())
    }

    async fn handle_registration_password(&self, msg: RegistrationPassword) -> Result<()> {
        if let Err(e) = self.registration.confirm_password(msg).await {
            warn!(error = %e, "registration_password_failed");
        }
        Ok(())
    }

    async fn handle_client_start(&self, msg: ClientControl) -> Result<()> {
        match self.registry.start(msg.user_id).await {
            Ok(_) => Ok(()),
            Err(Error::DatabaseNotFound(_)) => {
                self.publish_client_error(msg.user_id, "client not found")
                    .await
            }
            Err(e) => {
                // Unauthorized tokens already emitted client.status.
                self.publish_client_error(msg.user_id, &e.to_string()).await
            }
        }
    }

    async fn handle_client_stop(&self, msg: ClientControl) -> Result<()> {
        match self.registry.stop(msg.user_id).await {
            Ok(()) => Ok(()),
            Err(Error::ClientNotFound(_)) => {
                self.publish_client_error(msg.user_id, "client not found")
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Draft a reply for a matched message and deliver it through the
    /// author user's session, replying to the original message.
    ///
    /// Draft/send failures propagate so the broker redelivers; a missing
    /// session is reported as a status event and acked (redelivery cannot
    /// help until the client is started again).
    async fn handle_answer(&self, task: ReplyTask) -> Result<()> {
        let Some(session) = self.registry.get(task.user_id) else {
            error!(user_id = %task.user_id, "client_not_found");
            return self
                .publish_client_error(task.user_id, "no live session for answer")
                .await;
        };

        let reply = self.drafter.draft(&task).await?;
        let sent = session
            .send(task.chat_id, &reply, Some(task.telegram_message_id))
            .await?;
        info!(
            user_id = %task.user_id,
            chat_id = %task.chat_id,
            message_id = %sent,
            "message_answered"
        );
        Ok(())
    }

    async fn publish_client_error(&self, user_id: rdr_core::domain::UserId, error: &str) -> Result<()> {
        self.bus
            .publish_json(
                Queue::ClientError,
                &ClientError {
                    user_id,
                    error: error.to_string(),
                },
            )
            .await
    }
}
