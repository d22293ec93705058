//! Logging wrapper around the batch pipeline's terminal stage. Failures are
//! logged with batch context and re-raised so the broker layer decides on
//! redelivery; a flush never silently swallows a downstream error.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use rdr_core::domain::{InboundMessage, PartitionKey};
use rdr_core::Result;

use crate::collector::BatchSink;

pub struct BatchProcessor {
    downstream: Arc<dyn BatchSink>,
}

impl BatchProcessor {
    pub fn new(downstream: Arc<dyn BatchSink>) -> Arc<Self> {
        Arc::new(Self { downstream })
    }
}

#[async_trait]
impl BatchSink for BatchProcessor {
    async fn deliver(&self, key: PartitionKey, batch: Vec<InboundMessage>) -> Result<()> {
        if batch.is_empty() {
            debug!("no_messages_to_process");
            return Ok(());
        }

        let batch_size = batch.len();
        info!(
            user_id = %key.user_id,
            chat_id = %key.chat_id,
            batch_size,
            "starting_batch_processing"
        );

        match self.downstream.deliver(key, batch).await {
            Ok(()) => {
                info!(
                    user_id = %key.user_id,
                    chat_id = %key.chat_id,
                    batch_size,
                    "batch_processing_completed"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    user_id = %key.user_id,
                    chat_id = %key.chat_id,
                    batch_size,
                    error = %e,
                    "batch_processing_failed"
                );
                Err(e)
            }
        }
    }
}
