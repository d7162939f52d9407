use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

use super::{EventBus, HistoryStore, StoreError, Subscription};

/// Per-topic channel capacity. Subscribers that fall further behind than this
/// skip the oldest events.
const TOPIC_CAPACITY: usize = 1024;

/// In-process store and bus.
///
/// Logs are kept sorted by score; entries with equal scores keep insertion
/// order. Each topic is a `tokio::sync::broadcast` channel created on first
/// subscribe and removed when its last subscription is dropped; publishing to
/// a topic nobody listens on is a no-op.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: DashMap<String, Vec<(i64, String)>>,
    sets: DashMap<String, BTreeSet<String>>,
    topics: Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topics with at least one live subscription.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// Receiving end of one subscription. Dropping it removes the topic's
/// channel once no other receiver is left.
struct TopicReceiver {
    topic: String,
    receiver: Option<broadcast::Receiver<String>>,
    topics: Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl TopicReceiver {
    async fn next(&mut self) -> Option<String> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = %self.topic, skipped, "Subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for TopicReceiver {
    fn drop(&mut self) {
        // Release our receiver before checking whether anyone else listens
        self.receiver.take();
        let removed = self
            .topics
            .remove_if(&self.topic, |_, sender| sender.receiver_count() == 0);
        if removed.is_some() {
            tracing::debug!(topic = %self.topic, "Removed topic with no subscribers");
        }
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append(&self, key: &str, score: i64, entry: &str) -> Result<(), StoreError> {
        let mut log = self.logs.entry(key.to_string()).or_default();
        let position = log.partition_point(|(existing, _)| *existing <= score);
        log.insert(position, (score, entry.to_string()));
        Ok(())
    }

    async fn recent(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let Some(log) = self.logs.get(key) else {
            return Ok(Vec::new());
        };
        let start = log.len().saturating_sub(count);
        Ok(log[start..].iter().map(|(_, entry)| entry.clone()).collect())
    }

    async fn trim(&self, key: &str, keep: usize) -> Result<(), StoreError> {
        if let Some(mut log) = self.logs.get_mut(key) {
            let excess = log.len().saturating_sub(keep);
            log.drain(..excess);
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventBus for MemoryStore {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        if let Some(sender) = self.topics.get(topic) {
            // Err only means there are no live receivers.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, StoreError> {
        let receiver = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();

        let subscription = TopicReceiver {
            topic: topic.to_string(),
            receiver: Some(receiver),
            topics: Arc::clone(&self.topics),
        };
        let stream = futures_util::stream::unfold(subscription, |mut subscription| async move {
            let payload = subscription.next().await?;
            Some((payload, subscription))
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_recent_returns_newest_oldest_first() {
        let store = MemoryStore::new();
        for i in 1..=25 {
            store.append("log", i, &format!("m{}", i)).await.unwrap();
        }

        let recent = store.recent("log", 20).await.unwrap();
        assert_eq!(recent.len(), 20);
        assert_eq!(recent.first().unwrap(), "m6");
        assert_eq!(recent.last().unwrap(), "m25");
    }

    #[tokio::test]
    async fn test_append_orders_by_score() {
        let store = MemoryStore::new();
        store.append("log", 30, "late").await.unwrap();
        store.append("log", 10, "early").await.unwrap();
        store.append("log", 20, "middle").await.unwrap();
        store.append("log", 20, "middle-again").await.unwrap();

        let all = store.recent("log", 10).await.unwrap();
        assert_eq!(all, vec!["early", "middle", "middle-again", "late"]);
    }

    #[tokio::test]
    async fn test_recent_on_missing_key_is_empty() {
        let store = MemoryStore::new();
        assert!(store.recent("nothing", 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trim_keeps_newest() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store.append("log", i, &i.to_string()).await.unwrap();
        }
        store.trim("log", 3).await.unwrap();
        assert_eq!(store.recent("log", 100).await.unwrap(), vec!["7", "8", "9"]);
    }

    #[tokio::test]
    async fn test_set_deduplicates_and_removes() {
        let store = MemoryStore::new();
        store.set_add("members", "bob").await.unwrap();
        store.set_add("members", "alice").await.unwrap();
        store.set_add("members", "bob").await.unwrap();
        assert_eq!(store.set_members("members").await.unwrap(), vec!["alice", "bob"]);

        store.set_remove("members", "bob").await.unwrap();
        store.set_remove("members", "nobody").await.unwrap();
        assert_eq!(store.set_members("members").await.unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_of_topic_only() {
        let store = MemoryStore::new();
        let mut first = store.subscribe("news").await.unwrap();
        let mut second = store.subscribe("news").await.unwrap();
        let mut other = store.subscribe("other").await.unwrap();

        store.publish("news", "hello").await.unwrap();

        assert_eq!(first.next().await.unwrap(), "hello");
        assert_eq!(second.next().await.unwrap(), "hello");
        let nothing = tokio::time::timeout(Duration::from_millis(50), other.next()).await;
        assert!(nothing.is_err(), "unrelated topic must not receive the event");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let store = MemoryStore::new();
        store.publish("void", "dropped").await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_subscriptions_release_their_topics() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            let subscription = store.subscribe(&format!("dm:user-{}", i)).await.unwrap();
            drop(subscription);
        }
        assert_eq!(store.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_topic_survives_while_any_subscriber_remains() {
        let store = MemoryStore::new();
        let first = store.subscribe("dm:alice").await.unwrap();
        let mut second = store.subscribe("dm:alice").await.unwrap();

        drop(first);
        assert_eq!(store.topic_count(), 1);
        store.publish("dm:alice", "still here").await.unwrap();
        assert_eq!(second.next().await.unwrap(), "still here");

        drop(second);
        assert_eq!(store.topic_count(), 0);

        // A later subscribe starts a fresh channel
        let mut third = store.subscribe("dm:alice").await.unwrap();
        store.publish("dm:alice", "again").await.unwrap();
        assert_eq!(third.next().await.unwrap(), "again");
    }
}
