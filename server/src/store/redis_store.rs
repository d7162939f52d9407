use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::{EventBus, HistoryStore, StoreError, Subscription};

/// Redis-backed store and bus.
///
/// Logs are sorted sets scored by timestamp, member lists are plain sets and
/// topics map onto Redis PUBLISH/SUBSCRIBE channels. Commands share one
/// multiplexed connection; each subscription opens its own pub/sub connection
/// so dropping the stream unsubscribes.
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Open the client and verify the server answers PING.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::debug!(reply = %pong, "Redis answered PING");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl HistoryStore for RedisStore {
    async fn append(&self, key: &str, score: i64, entry: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zadd(key, entry, score).await?;
        Ok(())
    }

    async fn recent(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.zrange(key, -(count as isize), -1).await?;
        Ok(entries)
    }

    async fn trim(&self, key: &str, keep: usize) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // Ranks 0..=-(keep+1) are everything older than the newest `keep`.
        let _: i64 = conn.zremrangebyrank(key, 0, -(keep as isize) - 1).await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn.smembers(key).await?;
        members.sort();
        Ok(members)
    }
}

#[async_trait]
impl EventBus for RedisStore {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        let topic = topic.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = msg.get_payload::<String>();
            let topic = topic.clone();
            async move {
                match payload {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "Dropping non-UTF-8 bus payload");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
