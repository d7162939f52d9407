use axum::extract::ws::Message;

use super::{ConnectionRegistry, ConnectionSender};
use crate::ws::protocol::ServerEvent;

/// Send a text frame to every registered connection.
///
/// A failed send means that connection's writer has exited or its queue is
/// full; either way its reader is tearing it down. It is skipped and delivery
/// to the rest goes on. Returns how many connections accepted the frame.
pub fn broadcast_text(registry: &ConnectionRegistry, text: &str) -> usize {
    let msg = Message::Text(text.into());
    let mut delivered = 0;

    registry.for_each_connection(|id, sender| {
        if sender.send(msg.clone()) {
            delivered += 1;
        } else {
            tracing::debug!(connection_id = %id, "Skipping closed or saturated connection");
        }
    });

    delivered
}

/// Serialize a server event and send it to every registered connection.
pub fn broadcast_event(registry: &ConnectionRegistry, event: &ServerEvent) -> usize {
    match serde_json::to_string(event) {
        Ok(text) => broadcast_text(registry, &text),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode server event");
            0
        }
    }
}

/// Queue a text frame for one connection.
pub fn send_text(sender: &ConnectionSender, text: impl Into<String>) -> bool {
    sender.send(Message::Text(text.into().into()))
}

/// Serialize a server event and queue it for one connection.
pub fn send_event(sender: &ConnectionSender, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => send_text(sender, text),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode server event");
            false
        }
    }
}
