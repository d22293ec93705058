//! Queue consumers for the worker: raw events into the batch pipeline,
//! invalidation hooks into the matcher.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use rdr_core::bus::{spawn_consumer, MessageBus, Queue, TopicInvalidate};
use rdr_core::domain::InboundMessage;
use rdr_core::store::TopicDirectory;
use rdr_core::Result;
use rdr_embeddings::TextEncoder;

use crate::manager::BatchManager;
use crate::matcher::TopicMatcher;
use crate::processor::BatchProcessor;

pub struct WorkerService {
    bus: Arc<dyn MessageBus>,
    manager: Arc<BatchManager>,
    matcher: Arc<TopicMatcher>,
}

impl WorkerService {
    /// Assemble the pipeline: manager → processor → matcher → bus.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        encoder: Arc<dyn TextEncoder>,
        topics: Arc<dyn TopicDirectory>,
        batch_size: usize,
        batch_time: Duration,
        similarity_threshold: f32,
    ) -> Arc<Self> {
        let matcher = TopicMatcher::new(encoder, topics, bus.clone(), similarity_threshold);
        let processor = BatchProcessor::new(matcher.clone());
        let manager = Arc::new(BatchManager::new(batch_size, batch_time, processor));
        Arc::new(Self {
            bus,
            manager,
            matcher,
        })
    }

    pub fn matcher(&self) -> Arc<TopicMatcher> {
        self.matcher.clone()
    }

    /// Attach the `message.process` and `topic.invalidate` consumers.
    /// Returns once both are subscribed.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let svc = self.clone();
        spawn_consumer(
            self.bus.clone(),
            Queue::MessageProcess,
            cancel.clone(),
            move |msg: InboundMessage| {
                let svc = svc.clone();
                async move { svc.manager.add(msg).await }
            },
        )
        .await?;

        let svc = self.clone();
        spawn_consumer(
            self.bus.clone(),
            Queue::TopicInvalidate,
            cancel,
            move |msg: TopicInvalidate| {
                let svc = svc.clone();
                async move {
                    svc.matcher.invalidate(msg.user_id, msg.chat_id);
                    Ok(())
                }
            },
        )
        .await?;

        info!("worker_consumers_started");
        Ok(())
    }
}
