//! Presence: binding usernames to connections and announcing joins and
//! leaves over the bus.
//!
//! The registry is always updated before the bus publish, so a listener in
//! this process that reacts to the event sees the new registry state.
//! Other processes only learn of it through the event.

use crate::chat::messages::MEMBERS_KEY;
use crate::state::AppState;
use crate::ws::ConnectionId;

/// Bus topic announcing a joined member.
pub const MEMBER_ADD_TOPIC: &str = "member_add";

/// Bus topic announcing a departed member.
pub const MEMBER_REMOVE_TOPIC: &str = "member_remove";

/// Bind `name` to the connection, add it to the member set and announce it.
/// Returns false without side effects when the trimmed name is empty or
/// the connection is gone.
pub async fn join(state: &AppState, id: ConnectionId, name: &str) -> bool {
    if !state.connections.bind_username(id, name) {
        return false;
    }
    let name = name.trim();

    if let Err(e) = state.store.set_add(MEMBERS_KEY, name).await {
        tracing::warn!(username = %name, error = %e, "Failed to add member");
    }
    if let Err(e) = state.bus.publish(MEMBER_ADD_TOPIC, name).await {
        tracing::warn!(username = %name, error = %e, "Failed to announce join");
    }

    tracing::info!(connection_id = %id, username = %name, "Member joined");
    true
}

/// Remove the connection from the registry. If it had joined, drop its name
/// from the member set and announce the departure. Returns the name.
pub async fn leave(state: &AppState, id: ConnectionId) -> Option<String> {
    let name = state.connections.unregister(id)?;

    if let Err(e) = state.store.set_remove(MEMBERS_KEY, &name).await {
        tracing::warn!(username = %name, error = %e, "Failed to remove member");
    }
    if let Err(e) = state.bus.publish(MEMBER_REMOVE_TOPIC, &name).await {
        tracing::warn!(username = %name, error = %e, "Failed to announce leave");
    }

    tracing::info!(connection_id = %id, username = %name, "Member left");
    Some(name)
}
