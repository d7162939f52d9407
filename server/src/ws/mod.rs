pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;

use axum::extract::ws::Message;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Frames queued for one connection before it counts as too slow to keep.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Sender half of a WebSocket connection's outbound queue.
///
/// Every writer (fan-out listeners, router echoes, the ping task) goes
/// through this bounded queue; one writer task per connection drains it into
/// the socket, so frames never interleave. Sends never wait: a full queue
/// drops the frame and raises the overflow signal, which the connection's
/// reader loop turns into a teardown.
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    tx: mpsc::Sender<Message>,
    overflow: Arc<Notify>,
}

impl ConnectionSender {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sender = Self {
            tx,
            overflow: Arc::new(Notify::new()),
        };
        (sender, rx)
    }

    /// Queue a frame. Returns false when the frame was not queued, either
    /// because the writer is gone or because the queue is full.
    pub fn send(&self, msg: Message) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflow.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Resolves once a send found the queue full.
    pub async fn overflowed(&self) {
        self.overflow.notified().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Identifies one live WebSocket connection.
pub type ConnectionId = Uuid;

#[derive(Debug)]
struct Session {
    sender: ConnectionSender,
    username: Option<String>,
}

/// Connection registry: every live connection and the username it has
/// claimed, if any.
///
/// Usernames are not unique; two connections may bind the same name and
/// lookups by name return every match.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<ConnectionId, Session>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection with no bound username.
    pub fn register(&self, id: ConnectionId, sender: ConnectionSender) {
        self.sessions.insert(
            id,
            Session {
                sender,
                username: None,
            },
        );
        tracing::debug!(
            connection_id = %id,
            connections = self.sessions.len(),
            "Connection registered"
        );
    }

    /// Attach or replace the username of a live connection.
    /// Returns false (and changes nothing) when the trimmed name is empty or
    /// the connection is not registered.
    pub fn bind_username(&self, id: ConnectionId, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        match self.sessions.get_mut(&id) {
            Some(mut session) => {
                session.username = Some(name.to_string());
                true
            }
            None => false,
        }
    }

    /// Remove a connection, returning the username it had bound.
    /// Removing an unknown connection is a no-op.
    pub fn unregister(&self, id: ConnectionId) -> Option<String> {
        let removed = self.sessions.remove(&id);
        tracing::debug!(
            connection_id = %id,
            found = removed.is_some(),
            "Connection unregistered"
        );
        removed.and_then(|(_, session)| session.username)
    }

    pub fn username(&self, id: ConnectionId) -> Option<String> {
        self.sessions
            .get(&id)
            .and_then(|session| session.username.clone())
    }

    /// Apply `f` to every registered connection.
    ///
    /// Shard locks are held while `f` runs, so `f` must not call back into
    /// the registry. Connections removed concurrently are either visited or
    /// skipped, never visited twice.
    pub fn for_each_connection<F>(&self, mut f: F)
    where
        F: FnMut(ConnectionId, &ConnectionSender),
    {
        for entry in self.sessions.iter() {
            f(*entry.key(), &entry.value().sender);
        }
    }

    /// Ids of every connection currently bound to `name`.
    pub fn connections_named(&self, name: &str) -> Vec<ConnectionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().username.as_deref() == Some(name))
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Create a new empty connection registry.
pub fn new_connection_registry() -> Arc<ConnectionRegistry> {
    Arc::new(ConnectionRegistry::new())
}

/// Per-connection state owned by the connection's reader task.
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub tx: ConnectionSender,
    direct_listener: Option<JoinHandle<()>>,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId, tx: ConnectionSender) -> Self {
        Self {
            id,
            tx,
            direct_listener: None,
        }
    }

    /// Install the private-topic listener for the current username,
    /// stopping the one started by an earlier join.
    pub fn replace_direct_listener(&mut self, listener: JoinHandle<()>) {
        self.stop_direct_listener();
        self.direct_listener = Some(listener);
    }

    pub fn stop_direct_listener(&mut self) {
        if let Some(listener) = self.direct_listener.take() {
            listener.abort();
        }
    }

    pub fn has_direct_listener(&self) -> bool {
        self.direct_listener.is_some()
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        self.stop_direct_listener();
    }
}
