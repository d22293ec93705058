//! Per-partition-key event accumulation: flush on size or time, whichever
//! comes first, with at most one flush in flight per key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::error;

use rdr_core::domain::{InboundMessage, PartitionKey};
use rdr_core::Result;

/// Downstream receiver of a flushed batch.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn deliver(&self, key: PartitionKey, batch: Vec<InboundMessage>) -> Result<()>;
}

pub struct BatchCollector {
    key: PartitionKey,
    batch_size: usize,
    batch_time: Duration,
    sink: Arc<dyn BatchSink>,
    state: parking_lot::Mutex<CollectorState>,
    /// Per-key exclusion, shared with any successor collector for the same
    /// key. This is the one lock held across the downstream call.
    flush_lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Default)]
struct CollectorState {
    buffer: Vec<InboundMessage>,
    timer: Option<CancellationToken>,
}

impl BatchCollector {
    pub fn new(
        key: PartitionKey,
        batch_size: usize,
        batch_time: Duration,
        flush_lock: Arc<tokio::sync::Mutex<()>>,
        sink: Arc<dyn BatchSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            batch_size,
            batch_time,
            sink,
            state: parking_lot::Mutex::new(CollectorState::default()),
            flush_lock,
        })
    }

    /// Append one event. The first buffered event arms the flush timer;
    /// reaching `batch_size` flushes immediately.
    pub async fn add(self: &Arc<Self>, message: InboundMessage) -> Result<()> {
        let flush_now = {
            let mut state = self.state.lock();
            if state.buffer.is_empty() {
                state.timer = Some(self.arm_timer());
            }
            state.buffer.push(message);
            state.buffer.len() >= self.batch_size
        };

        if flush_now {
            self.flush().await?;
        }
        Ok(())
    }

    /// Swap the buffer for an empty one and cancel the pending timer as one
    /// step, then hand the swapped batch downstream under the per-key flush
    /// lock. Events added while the downstream call runs start a new batch.
    pub async fn flush(&self) -> Result<()> {
        let _exclusive = self.flush_lock.lock().await;

        let batch = {
            let mut state = self.state.lock();
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            std::mem::take(&mut state.buffer)
        };

        if batch.is_empty() {
            return Ok(());
        }
        self.sink.deliver(self.key, batch).await
    }

    /// Nothing buffered and no timer armed.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.buffer.is_empty() && state.timer.is_none()
    }

    fn arm_timer(self: &Arc<Self>) -> CancellationToken {
        let token = CancellationToken::new();
        let collector = self.clone();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = sleep(collector.batch_time) => {
                    if let Err(e) = collector.flush().await {
                        error!(
                            user_id = %collector.key.user_id,
                            chat_id = %collector.key.chat_id,
                            error = %e,
                            "batch_flush_failed"
                        );
                    }
                }
            }
        });
        token
    }
}
