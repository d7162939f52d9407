//! Fan-out listeners bridging bus topics to locally held connections.
//!
//! Three long-lived tasks (public messages, member joins, member leaves)
//! deliver to every registered connection. Each joined connection also runs
//! one private listener on its `dm:<name>` topic that writes to that
//! connection alone.

use futures_util::StreamExt;
use tokio::task::JoinHandle;

use crate::chat::messages::{direct_topic, PUBLIC_TOPIC};
use crate::chat::presence::{MEMBER_ADD_TOPIC, MEMBER_REMOVE_TOPIC};
use crate::state::AppState;
use crate::store::{StoreError, Subscription};
use crate::ws::broadcast::{broadcast_event, broadcast_text, send_text};
use crate::ws::protocol::ServerEvent;
use crate::ws::{ConnectionId, ConnectionSender};

/// Topics fanned out to every local connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutTopic {
    Messages,
    MemberAdd,
    MemberRemove,
}

impl FanoutTopic {
    pub const ALL: [FanoutTopic; 3] = [
        FanoutTopic::Messages,
        FanoutTopic::MemberAdd,
        FanoutTopic::MemberRemove,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FanoutTopic::Messages => PUBLIC_TOPIC,
            FanoutTopic::MemberAdd => MEMBER_ADD_TOPIC,
            FanoutTopic::MemberRemove => MEMBER_REMOVE_TOPIC,
        }
    }

    /// Deliver one bus payload to every registered connection.
    /// Chat messages go out as the raw stored bytes; member events carry the
    /// bare username on the bus and are wrapped for clients.
    fn deliver(self, state: &AppState, payload: String) -> usize {
        match self {
            FanoutTopic::Messages => broadcast_text(&state.connections, &payload),
            FanoutTopic::MemberAdd => {
                broadcast_event(&state.connections, &ServerEvent::MemberAdd { name: payload })
            }
            FanoutTopic::MemberRemove => {
                broadcast_event(&state.connections, &ServerEvent::MemberRemove { name: payload })
            }
        }
    }
}

/// Subscribe to every fan-out topic and spawn its listener.
/// Fails if any initial subscription fails, so startup can abort.
pub async fn spawn_topic_listeners(state: &AppState) -> Result<Vec<JoinHandle<()>>, StoreError> {
    let mut handles = Vec::with_capacity(FanoutTopic::ALL.len());
    for topic in FanoutTopic::ALL {
        handles.push(spawn_topic_listener(state.clone(), topic).await?);
    }
    Ok(handles)
}

/// Subscribe to one fan-out topic and spawn its listener task.
pub async fn spawn_topic_listener(
    state: AppState,
    topic: FanoutTopic,
) -> Result<JoinHandle<()>, StoreError> {
    let subscription = state.bus.subscribe(topic.name()).await?;
    tracing::debug!(topic = topic.name(), "Fan-out listener subscribed");
    Ok(tokio::spawn(run_topic_listener(state, topic, subscription)))
}

async fn run_topic_listener(state: AppState, topic: FanoutTopic, mut subscription: Subscription) {
    loop {
        while let Some(payload) = subscription.next().await {
            let delivered = topic.deliver(&state, payload);
            tracing::trace!(topic = topic.name(), delivered, "Fan-out delivered");
        }

        tracing::error!(topic = topic.name(), "Bus subscription ended, resubscribing");
        subscription = resubscribe(&state, topic.name()).await;
    }
}

async fn resubscribe(state: &AppState, topic: &str) -> Subscription {
    loop {
        tokio::time::sleep(state.settings.resubscribe_delay).await;
        match state.bus.subscribe(topic).await {
            Ok(subscription) => {
                tracing::info!(topic = %topic, "Bus subscription restored");
                return subscription;
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Resubscribe failed");
            }
        }
    }
}

/// Subscribe to `username`'s private topic and spawn a task forwarding each
/// payload to one connection. The subscription is live when this returns.
/// The task ends when the connection's queue closes; the owner aborts it on
/// re-join and on teardown.
pub async fn spawn_direct_listener(
    state: &AppState,
    id: ConnectionId,
    username: &str,
    tx: ConnectionSender,
) -> Result<JoinHandle<()>, StoreError> {
    let topic = direct_topic(username);
    let mut subscription = state.bus.subscribe(&topic).await?;
    tracing::debug!(connection_id = %id, topic = %topic, "Direct listener subscribed");

    Ok(tokio::spawn(async move {
        while let Some(payload) = subscription.next().await {
            if !send_text(&tx, payload) {
                tracing::debug!(connection_id = %id, topic = %topic, "Connection queue closed or full, stopping direct listener");
                return;
            }
        }
        tracing::warn!(connection_id = %id, topic = %topic, "Direct subscription ended");
    }))
}
