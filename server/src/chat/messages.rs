//! Chat message model, conversation keys, and the persist-then-publish path
//! for public and direct messages.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::state::AppState;
use crate::ws::protocol::ServerEvent;

/// History key of the public conversation.
pub const PUBLIC_HISTORY_KEY: &str = "chat:messages";

/// Set key holding the usernames of joined members.
pub const MEMBERS_KEY: &str = "chat:members";

/// Bus topic carrying public messages.
pub const PUBLIC_TOPIC: &str = "messages";

/// Bus topic carrying direct messages addressed to `username`.
pub fn direct_topic(username: &str) -> String {
    format!("dm:{}", username)
}

/// One chat message. The JSON form is both the wire and the storage
/// representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user: String,
    pub text: String,
    /// Seconds since the Unix epoch
    pub time: i64,
}

impl ChatMessage {
    /// A message stamped with the current wall-clock time.
    pub fn new(user: &str, text: &str) -> Self {
        Self::at(user, text, Utc::now().timestamp())
    }

    pub fn at(user: &str, text: &str, time: i64) -> Self {
        Self {
            user: user.to_string(),
            text: text.to_string(),
            time,
        }
    }
}

/// Which history log a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversation<'a> {
    Public,
    /// Keyed in (sender, receiver) order: replies from the receiver land
    /// under a different key.
    Direct { sender: &'a str, receiver: &'a str },
}

impl Conversation<'_> {
    pub fn storage_key(&self) -> String {
        match self {
            Conversation::Public => PUBLIC_HISTORY_KEY.to_string(),
            Conversation::Direct { sender, receiver } => {
                format!("chat:dm:{}:{}", sender, receiver)
            }
        }
    }
}

/// Persist a public message and publish it on the public topic.
/// Returns the serialized payload.
pub async fn post_public(state: &AppState, user: &str, text: &str) -> Option<String> {
    let message = ChatMessage::new(user, text);
    let payload = encode(&message)?;

    persist(state, Conversation::Public, &message, &payload).await;

    if let Err(e) = state.bus.publish(PUBLIC_TOPIC, &payload).await {
        tracing::warn!(topic = PUBLIC_TOPIC, error = %e, "Failed to publish public message");
    }

    Some(payload)
}

/// Persist a direct message under (sender, receiver) and publish it on the
/// receiver's private topic. Returns the serialized payload so the caller
/// can echo it to the sender.
pub async fn post_direct(
    state: &AppState,
    sender: &str,
    receiver: &str,
    text: &str,
) -> Option<String> {
    let message = ChatMessage::new(sender, text);
    let payload = encode(&message)?;

    persist(state, Conversation::Direct { sender, receiver }, &message, &payload).await;

    let topic = direct_topic(receiver);
    if let Err(e) = state.bus.publish(&topic, &payload).await {
        tracing::warn!(topic = %topic, error = %e, "Failed to publish direct message");
    }

    Some(payload)
}

/// Snapshot sent once to a freshly accepted connection: current members and
/// the newest public history, oldest first.
pub async fn init_snapshot(state: &AppState) -> ServerEvent {
    let members = match state.store.set_members(MEMBERS_KEY).await {
        Ok(members) => members,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read member set");
            Vec::new()
        }
    };

    let history = match state
        .store
        .recent(PUBLIC_HISTORY_KEY, state.settings.history_window)
        .await
    {
        Ok(entries) => entries
            .iter()
            .filter_map(|raw| match serde_json::from_str::<ChatMessage>(raw) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping undecodable history entry");
                    None
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read public history");
            Vec::new()
        }
    };

    ServerEvent::Init { members, history }
}

fn encode(message: &ChatMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode chat message");
            None
        }
    }
}

/// Append to history, then trim to the retention bound. Failures are logged
/// and the caller still publishes.
async fn persist(
    state: &AppState,
    conversation: Conversation<'_>,
    message: &ChatMessage,
    payload: &str,
) {
    let key = conversation.storage_key();

    if let Err(e) = state.store.append(&key, message.time, payload).await {
        tracing::warn!(key = %key, error = %e, "Failed to persist message");
        return;
    }

    if let Some(keep) = state.settings.history_retention {
        if let Err(e) = state.store.trim(&key, keep).await {
            tracing::warn!(key = %key, error = %e, "Failed to trim history");
        }
    }
}
