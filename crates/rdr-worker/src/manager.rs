//! Fans incoming events out to per-key collectors, creating them lazily and
//! retiring them once their flush completes.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

use rdr_core::domain::{InboundMessage, PartitionKey};
use rdr_core::Result;

use crate::collector::{BatchCollector, BatchSink};

pub struct BatchManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    batch_size: usize,
    batch_time: Duration,
    downstream: Arc<dyn BatchSink>,
    collectors: parking_lot::Mutex<HashMap<PartitionKey, Arc<BatchCollector>>>,
    // Flush locks outlive collector generations so a successor collector for
    // the same key serializes behind its predecessor's in-flight flush.
    flush_locks: parking_lot::Mutex<HashMap<PartitionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl BatchManager {
    pub fn new(batch_size: usize, batch_time: Duration, downstream: Arc<dyn BatchSink>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                batch_size,
                batch_time,
                downstream,
                collectors: parking_lot::Mutex::new(HashMap::new()),
                flush_locks: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Route one event to its key's collector, creating it on first use.
    pub async fn add(&self, message: InboundMessage) -> Result<()> {
        let collector = self.inner.collector_for(message.partition_key());
        collector.add(message).await
    }

    #[cfg(test)]
    fn live_collectors(&self) -> usize {
        self.inner.collectors.lock().len()
    }
}

impl ManagerInner {
    fn collector_for(self: &Arc<Self>, key: PartitionKey) -> Arc<BatchCollector> {
        let flush_lock = self
            .flush_locks
            .lock()
            .entry(key)
            .or_default()
            .clone();

        self.collectors
            .lock()
            .entry(key)
            .or_insert_with(|| {
                BatchCollector::new(
                    key,
                    self.batch_size,
                    self.batch_time,
                    flush_lock,
                    Arc::new(RetireOnDeliver {
                        manager: Arc::downgrade(self),
                    }),
                )
            })
            .clone()
    }

    /// Drop the key's collector once its flush has gone downstream, unless
    /// events arrived during the flush and it is mid-batch again.
    fn retire_if_idle(&self, key: PartitionKey) {
        let mut collectors = self.collectors.lock();
        if let Some(current) = collectors.get(&key) {
            if current.is_idle() {
                collectors.remove(&key);
            }
        }
    }
}

struct RetireOnDeliver {
    manager: Weak<ManagerInner>,
}

#[async_trait]
impl BatchSink for RetireOnDeliver {
    async fn deliver(&self, key: PartitionKey, batch: Vec<InboundMessage>) -> Result<()> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        manager.downstream.deliver(key, batch).await?;
        manager.retire_if_idle(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rdr_core::domain::{ChatId, MessageId, UserId};

    fn message(user_id: i64, chat_id: i64, id: i32) -> InboundMessage {
        InboundMessage {
            telegram_message_id: MessageId(id),
            user_id: UserId(user_id),
            chat_id: ChatId(chat_id),
            text: format!("message {id}"),
            sender_username: None,
            sender_id: UserId(900),
            created_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: parking_lot::Mutex<Vec<(PartitionKey, Vec<InboundMessage>)>>,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn deliver(&self, key: PartitionKey, batch: Vec<InboundMessage>) -> Result<()> {
            self.batches.lock().push((key, batch));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn events_group_by_partition_key() {
        let sink = Arc::new(RecordingSink::default());
        let manager = BatchManager::new(2, Duration::from_secs(60), sink.clone());

        manager.add(message(1, -10, 1)).await.unwrap();
        manager.add(message(1, -20, 2)).await.unwrap();
        manager.add(message(2, -10, 3)).await.unwrap();
        assert_eq!(manager.live_collectors(), 3);

        manager.add(message(1, -10, 4)).await.unwrap();

        let batches = sink.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].0,
            PartitionKey {
                user_id: UserId(1),
                chat_id: ChatId(-10)
            }
        );
        assert_eq!(
            batches[0]
                .1
                .iter()
                .map(|m| m.telegram_message_id.0)
                .collect::<Vec<_>>(),
            vec![1, 4]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn collector_is_retired_after_its_flush() {
        let sink = Arc::new(RecordingSink::default());
        let manager = BatchManager::new(2, Duration::from_secs(60), sink.clone());

        manager.add(message(1, -10, 1)).await.unwrap();
        manager.add(message(1, -10, 2)).await.unwrap();
        assert_eq!(manager.live_collectors(), 0);

        // The next event gets a fresh collector.
        manager.add(message(1, -10, 3)).await.unwrap();
        assert_eq!(manager.live_collectors(), 1);
    }

    struct FailingSink;

    #[async_trait]
    impl BatchSink for FailingSink {
        async fn deliver(&self, _key: PartitionKey, _batch: Vec<InboundMessage>) -> Result<()> {
            Err(rdr_core::Error::External("downstream is down".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn downstream_failure_propagates_to_the_caller() {
        let manager = BatchManager::new(1, Duration::from_secs(60), Arc::new(FailingSink));
        let err = manager.add(message(1, -10, 1)).await.unwrap_err();
        assert!(matches!(err, rdr_core::Error::External(_)));
    }
}
