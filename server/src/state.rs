use std::sync::Arc;
use std::time::Duration;

use crate::store::{Backend, EventBus, HistoryStore};
use crate::ws::{new_connection_registry, ConnectionRegistry, OUTBOUND_CAPACITY};

/// Runtime tuning derived from `Config`.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Public history entries sent in the init snapshot.
    pub history_window: usize,
    /// Entries kept per conversation log after each append; None keeps all.
    pub history_retention: Option<usize>,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Close connections silent for this long; None disables.
    pub idle_timeout: Option<Duration>,
    /// Back-off before re-subscribing a fan-out listener whose stream ended.
    pub resubscribe_delay: Duration,
    /// Frames queued per connection; a connection that falls this far
    /// behind is closed.
    pub outbound_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            history_window: 20,
            history_retention: Some(1000),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(300)),
            resubscribe_delay: Duration::from_millis(1000),
            outbound_capacity: OUTBOUND_CAPACITY,
        }
    }
}

/// Shared application state passed to all handlers via axum State extractor.
/// Built once in `main` (or a test) and cloned into every task.
#[derive(Clone)]
pub struct AppState {
    /// Live WebSocket connections and their bound usernames
    pub connections: Arc<ConnectionRegistry>,
    /// Message logs and the active member set
    pub store: Arc<dyn HistoryStore>,
    /// Topic pub/sub shared with every other hub process
    pub bus: Arc<dyn EventBus>,
    pub settings: HubSettings,
}

impl AppState {
    pub fn new(backend: Backend, settings: HubSettings) -> Self {
        Self {
            connections: new_connection_registry(),
            store: backend.history,
            bus: backend.bus,
            settings,
        }
    }

    /// State over a fresh in-process backend.
    pub fn in_memory(settings: HubSettings) -> Self {
        Self::new(Backend::memory(), settings)
    }
}
