//! External history store and event bus capabilities.
//!
//! The hub never owns durable state itself: message logs, the active member
//! set and topic pub/sub all live behind these two traits. `RedisStore` is the
//! production backend; `MemoryStore` runs the same contract in-process for a
//! single-node deployment and for tests.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// `store_url` value selecting the in-process backend.
pub const MEMORY_URL: &str = "memory";

/// Stream of raw payloads published to one topic.
pub type Subscription = BoxStream<'static, String>;

/// Errors raised by a store or bus backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("unsupported store url: {0}")]
    UnsupportedUrl(String),
}

/// Ordered, scored logs keyed by conversation, plus plain string sets.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert `entry` into the log at `key`, ordered by `score`.
    async fn append(&self, key: &str, score: i64, entry: &str) -> Result<(), StoreError>;

    /// The newest `count` entries of the log at `key`, oldest first.
    async fn recent(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError>;

    /// Drop everything but the newest `keep` entries of the log at `key`.
    async fn trim(&self, key: &str, keep: usize) -> Result<(), StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// All members of the set at `key`, sorted.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

/// Named-topic publish/subscribe.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to `topic`. The subscription is live once this returns:
    /// anything published afterwards is delivered to the stream.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, StoreError>;
}

/// The pair of capabilities a running hub is wired to.
#[derive(Clone)]
pub struct Backend {
    pub history: Arc<dyn HistoryStore>,
    pub bus: Arc<dyn EventBus>,
}

impl Backend {
    /// In-process backend; history and bus share one `MemoryStore`.
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        let history: Arc<dyn HistoryStore> = store.clone();
        let bus: Arc<dyn EventBus> = store;
        Self { history, bus }
    }

    /// Connect to the backend named by `url` (`memory` or `redis://...`).
    /// Fails if the backend is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        if url == MEMORY_URL {
            return Ok(Self::memory());
        }
        if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
            return Err(StoreError::UnsupportedUrl(url.to_string()));
        }

        let store = Arc::new(RedisStore::connect(url).await?);
        let history: Arc<dyn HistoryStore> = store.clone();
        let bus: Arc<dyn EventBus> = store;
        Ok(Self { history, bus })
    }
}
