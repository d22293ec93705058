//! Scores batched messages against the chat's topic vectors and emits a
//! reply task for every message that clears the similarity threshold.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use rdr_core::bus::{MessageBus, MessageBusExt, Queue};
use rdr_core::domain::{ChatId, InboundMessage, PartitionKey, ReplyTask, Topic, UserId};
use rdr_core::store::TopicDirectory;
use rdr_core::Result;
use rdr_embeddings::similarity::{argmax_row, cosine_matrix};
use rdr_embeddings::TextEncoder;

use crate::collector::BatchSink;

/// One topic with its encoded vector.
#[derive(Clone, Debug)]
pub struct TopicVector {
    pub topic: Topic,
    pub vector: Vec<f32>,
}

/// Cache slot per (user, chat). The generation counter fences a fetch that
/// raced an invalidation: the install is discarded and the fetch retried, so
/// vectors for a removed topic set are never served after `invalidate`
/// returns.
#[derive(Default)]
struct CacheSlot {
    generation: u64,
    vectors: Option<Arc<Vec<TopicVector>>>,
}

pub struct TopicMatcher {
    encoder: Arc<dyn TextEncoder>,
    topics: Arc<dyn TopicDirectory>,
    bus: Arc<dyn MessageBus>,
    threshold: f32,
    cache: parking_lot::Mutex<HashMap<(UserId, ChatId), CacheSlot>>,
}

impl TopicMatcher {
    pub fn new(
        encoder: Arc<dyn TextEncoder>,
        topics: Arc<dyn TopicDirectory>,
        bus: Arc<dyn MessageBus>,
        threshold: f32,
    ) -> Arc<Self> {
        Arc::new(Self {
            encoder,
            topics,
            bus,
            threshold,
            cache: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Cached topic vectors for one chat, fetching and encoding on first
    /// use. Topics are ordered by ascending id so the first-occurrence
    /// argmax resolves ties to the lowest topic id.
    pub async fn topic_vectors(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<Arc<Vec<TopicVector>>> {
        loop {
            let generation = {
                let mut cache = self.cache.lock();
                let slot = cache.entry((user_id, chat_id)).or_default();
                if let Some(vectors) = &slot.vectors {
                    return Ok(vectors.clone());
                }
                slot.generation
            };

            let mut topics = self.topics.topics(user_id, chat_id).await?;
            topics.sort_by_key(|t| t.id);
            let texts: Vec<String> = topics.iter().map(Topic::embedding_text).collect();
            let vectors = self.encoder.encode(&texts).await?;
            let entry: Arc<Vec<TopicVector>> = Arc::new(
                topics
                    .into_iter()
                    .zip(vectors)
                    .map(|(topic, vector)| TopicVector { topic, vector })
                    .collect(),
            );

            let mut cache = self.cache.lock();
            let slot = cache.entry((user_id, chat_id)).or_default();
            if slot.generation == generation {
                slot.vectors = Some(entry.clone());
                return Ok(entry);
            }
            // Invalidated while we fetched; what we encoded may predate the
            // change. Refetch.
        }
    }

    /// Evict the chat's cache entry. The next lookup refetches.
    pub fn invalidate(&self, user_id: UserId, chat_id: ChatId) {
        let mut cache = self.cache.lock();
        let slot = cache.entry((user_id, chat_id)).or_default();
        slot.generation = slot.generation.wrapping_add(1);
        slot.vectors = None;
        info!(user_id = %user_id, chat_id = %chat_id, "topic_cache_invalidated");
    }

    /// Encode the batch, score it against the topic vectors and build a
    /// reply task per message at or above the threshold. Messages below it
    /// are dropped with no output.
    pub async fn score_batch(
        &self,
        messages: &[InboundMessage],
        topic_vectors: &[TopicVector],
    ) -> Result<Vec<ReplyTask>> {
        let texts: Vec<String> = messages.iter().map(|m| m.text.clone()).collect();
        let message_vectors = self.encoder.encode(&texts).await?;
        let topic_matrix: Vec<Vec<f32>> =
            topic_vectors.iter().map(|tv| tv.vector.clone()).collect();

        let sims = cosine_matrix(&message_vectors, &topic_matrix)?;

        let mut tasks = Vec::new();
        for (i, message) in messages.iter().enumerate() {
            let Some((best, score)) = argmax_row(sims.row(i)) else {
                continue;
            };
            let topic = &topic_vectors[best].topic;
            if score >= self.threshold {
                debug!(
                    user_id = %message.user_id,
                    chat_id = %message.chat_id,
                    topic_id = %topic.id,
                    score,
                    "message_matched"
                );
                tasks.push(ReplyTask {
                    user_id: message.user_id,
                    chat_id: message.chat_id,
                    telegram_message_id: message.telegram_message_id,
                    content: message.text.clone(),
                    topic_id: topic.id,
                    score,
                    sender_username: message.sender_username.clone(),
                    sender_id: message.sender_id,
                    created_at: message.created_at,
                });
            } else {
                debug!(
                    user_id = %message.user_id,
                    chat_id = %message.chat_id,
                    score,
                    "below_threshold_dropped"
                );
            }
        }
        Ok(tasks)
    }
}

#[async_trait]
impl BatchSink for TopicMatcher {
    async fn deliver(&self, key: PartitionKey, batch: Vec<InboundMessage>) -> Result<()> {
        let vectors = self.topic_vectors(key.user_id, key.chat_id).await?;
        if vectors.is_empty() {
            debug!(
                user_id = %key.user_id,
                chat_id = %key.chat_id,
                "no_topics_bound_dropping_batch"
            );
            return Ok(());
        }

        let tasks = self.score_batch(&batch, &vectors).await?;
        for task in tasks {
            self.bus.publish_json(Queue::MessageAnswer, &task).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rdr_core::domain::{MessageId, TopicId};
    use rdr_core::memory::{MemoryBus, MemoryStore};
    use rdr_embeddings::HashingEncoder;

    fn topic(id: i64, name: &str, description: &str) -> Topic {
        Topic {
            id: TopicId(id),
            name: name.to_string(),
            description: description.to_string(),
        }
    }

    fn message(id: i32, text: &str) -> InboundMessage {
        InboundMessage {
            telegram_message_id: MessageId(id),
            user_id: UserId(1),
            chat_id: ChatId(-10),
            text: text.to_string(),
            sender_username: Some("alice".to_string()),
            sender_id: UserId(900),
            created_at: Utc::now(),
        }
    }

    fn matcher_with(
        store: Arc<MemoryStore>,
        bus: MemoryBus,
        threshold: f32,
    ) -> Arc<TopicMatcher> {
        TopicMatcher::new(
            Arc::new(HashingEncoder::new(32)),
            store,
            Arc::new(bus),
            threshold,
        )
    }

    #[tokio::test]
    async fn message_identical_to_topic_text_scores_one() {
        let store = Arc::new(MemoryStore::new());
        store.set_topics(
            UserId(1),
            ChatId(-10),
            vec![topic(1, "billing", "invoices and payments")],
        );
        let bus = MemoryBus::new();
        let matcher = matcher_with(store, bus, 0.5);

        let vectors = matcher.topic_vectors(UserId(1), ChatId(-10)).await.unwrap();
        let tasks = matcher
            .score_batch(&[message(1, "billing invoices and payments")], &vectors)
            .await
            .unwrap();

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].topic_id, TopicId(1));
        assert!((tasks[0].score - 1.0).abs() < 1e-5);
    }

    /// Encoder with exact unit-axis vectors, so cosine scores carry no
    /// floating-point slack and the `>=` gate can be pinned down.
    struct AxisEncoder;

    #[async_trait]
    impl rdr_embeddings::TextEncoder for AxisEncoder {
        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("support") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn score_exactly_at_threshold_is_included() {
        let store = Arc::new(MemoryStore::new());
        store.set_topics(UserId(1), ChatId(-10), vec![topic(1, "support", "help")]);
        // Axis vectors make the match score exactly 1.0; threshold 1.0
        // exercises the >= gate.
        let matcher = TopicMatcher::new(
            Arc::new(AxisEncoder),
            store,
            Arc::new(MemoryBus::new()),
            1.0,
        );

        let vectors = matcher.topic_vectors(UserId(1), ChatId(-10)).await.unwrap();
        let tasks = matcher
            .score_batch(&[message(1, "support ticket")], &vectors)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);

        // An orthogonal message scores 0.0 and is dropped.
        let tasks = matcher
            .score_batch(&[message(2, "unrelated")], &vectors)
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn tie_resolves_to_lowest_topic_id() {
        let store = Arc::new(MemoryStore::new());
        // Identical descriptive text: both topics encode to the same vector.
        store.set_topics(
            UserId(1),
            ChatId(-10),
            vec![topic(8, "twin", "same words"), topic(3, "twin", "same words")],
        );
        let bus = MemoryBus::new();
        let matcher = matcher_with(store, bus, 0.5);

        let vectors = matcher.topic_vectors(UserId(1), ChatId(-10)).await.unwrap();
        let tasks = matcher
            .score_batch(&[message(1, "twin same words")], &vectors)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].topic_id, TopicId(3));
    }

    #[tokio::test]
    async fn below_threshold_messages_are_dropped() {
        let store = Arc::new(MemoryStore::new());
        store.set_topics(UserId(1), ChatId(-10), vec![topic(1, "billing", "money")]);
        let bus = MemoryBus::new();
        // Hash vectors of unrelated texts essentially never reach 0.999.
        let matcher = matcher_with(store, bus, 0.999);

        let vectors = matcher.topic_vectors(UserId(1), ChatId(-10)).await.unwrap();
        let tasks = matcher
            .score_batch(&[message(1, "completely unrelated chatter")], &vectors)
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn vectors_are_cached_until_invalidated() {
        let store = Arc::new(MemoryStore::new());
        store.set_topics(UserId(1), ChatId(-10), vec![topic(1, "old", "topic")]);
        let bus = MemoryBus::new();
        let matcher = matcher_with(store.clone(), bus, 0.5);

        let first = matcher.topic_vectors(UserId(1), ChatId(-10)).await.unwrap();
        assert_eq!(first[0].topic.name, "old");

        // The store changes, but the cache still serves the old set.
        store.set_topics(UserId(1), ChatId(-10), vec![topic(2, "new", "topic")]);
        let cached = matcher.topic_vectors(UserId(1), ChatId(-10)).await.unwrap();
        assert_eq!(cached[0].topic.name, "old");

        matcher.invalidate(UserId(1), ChatId(-10));
        let refreshed = matcher.topic_vectors(UserId(1), ChatId(-10)).await.unwrap();
        assert_eq!(refreshed[0].topic.name, "new");
    }

    /// A directory that reads the topic set, then parks until released —
    /// so a test can change the set and invalidate the chat while a fetch
    /// holds the soon-to-be-stale snapshot.
    struct StallingDirectory {
        store: Arc<MemoryStore>,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl TopicDirectory for StallingDirectory {
        async fn topics(&self, user_id: UserId, chat_id: ChatId) -> Result<Vec<Topic>> {
            let snapshot = self.store.topics(user_id, chat_id).await?;
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| rdr_core::Error::External(e.to_string()))?;
            permit.forget();
            Ok(snapshot)
        }
    }

    #[tokio::test]
    async fn fetch_racing_an_invalidation_never_installs_stale_vectors() {
        let store = Arc::new(MemoryStore::new());
        store.set_topics(UserId(1), ChatId(-10), vec![topic(1, "old", "topic")]);
        let directory = Arc::new(StallingDirectory {
            store: store.clone(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let matcher = TopicMatcher::new(
            Arc::new(HashingEncoder::new(32)),
            directory.clone(),
            Arc::new(MemoryBus::new()),
            0.5,
        );

        let racing = {
            let matcher = matcher.clone();
            tokio::spawn(async move { matcher.topic_vectors(UserId(1), ChatId(-10)).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // The topic set changes and the chat is invalidated while the fetch
        // is parked on the directory.
        store.set_topics(UserId(1), ChatId(-10), vec![topic(2, "new", "topic")]);
        matcher.invalidate(UserId(1), ChatId(-10));

        // Release the parked fetch and its retry.
        directory.gate.add_permits(2);
        let vectors = racing.await.unwrap().unwrap();
        assert_eq!(vectors[0].topic.name, "new");

        let cached = matcher.topic_vectors(UserId(1), ChatId(-10)).await.unwrap();
        assert_eq!(cached[0].topic.name, "new");
    }

    #[tokio::test]
    async fn batch_for_chat_without_topics_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let mut answer_rx = bus.subscribe(Queue::MessageAnswer).await.unwrap();
        let matcher = matcher_with(store, bus, 0.5);

        matcher
            .deliver(
                PartitionKey {
                    user_id: UserId(1),
                    chat_id: ChatId(-10),
                },
                vec![message(1, "anything")],
            )
            .await
            .unwrap();
        assert!(answer_rx.try_recv().is_err());
    }
}
