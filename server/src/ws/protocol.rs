//! Text protocol: inbound command parsing, dispatch, and outbound events.
//!
//! Inbound frames are one command each:
//! - `join:<name>`
//! - `msg:<user>:<text>` (split on the first `:`)
//! - `dm:<sender>:<receiver>:<text>` (split on the first two `:`)
//!
//! Anything else, including a recognized prefix with missing fields, is
//! dropped without a reply.

use serde::Serialize;

use crate::chat::messages::{self, ChatMessage};
use crate::chat::{listeners, presence};
use crate::state::AppState;
use crate::ws::broadcast::send_text;
use crate::ws::ConnectionContext;

/// One parsed inbound command. Fields borrow from the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// Claim a username; the name is already trimmed and non-empty.
    Join { name: &'a str },
    /// Public broadcast.
    Public { user: &'a str, text: &'a str },
    /// Private message to every connection joined as `receiver`.
    Direct {
        sender: &'a str,
        receiver: &'a str,
        text: &'a str,
    },
}

impl<'a> Command<'a> {
    /// Classify a frame. Returns None for anything that should be ignored.
    pub fn parse(frame: &'a str) -> Option<Self> {
        if let Some(rest) = frame.strip_prefix("join:") {
            let name = rest.trim();
            return (!name.is_empty()).then_some(Command::Join { name });
        }

        if let Some(rest) = frame.strip_prefix("dm:") {
            let mut parts = rest.splitn(3, ':');
            let sender = parts.next()?;
            let receiver = parts.next()?;
            let text = parts.next()?;
            return Some(Command::Direct {
                sender,
                receiver,
                text,
            });
        }

        if let Some(rest) = frame.strip_prefix("msg:") {
            let (user, text) = rest.split_once(':')?;
            return Some(Command::Public { user, text });
        }

        None
    }
}

/// Structured server-to-client events. Chat messages themselves are sent
/// as the bare serialized `ChatMessage`, not wrapped in an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once right after connect.
    Init {
        members: Vec<String>,
        history: Vec<ChatMessage>,
    },
    MemberAdd {
        name: String,
    },
    MemberRemove {
        name: String,
    },
}

/// Plain-text acknowledgement of a successful join.
pub fn welcome_text(name: &str) -> String {
    format!("Welcome {}!", name)
}

/// Handle one inbound text frame from `conn`.
pub async fn handle_text_message(text: &str, conn: &mut ConnectionContext, state: &AppState) {
    let Some(command) = Command::parse(text) else {
        tracing::debug!(
            connection_id = %conn.id,
            "Ignoring unrecognized frame: {}",
            text.chars().take(100).collect::<String>()
        );
        return;
    };

    match command {
        Command::Join { name } => handle_join(name, conn, state).await,
        Command::Public { user, text } => {
            messages::post_public(state, user, text).await;
        }
        Command::Direct {
            sender,
            receiver,
            text,
        } => {
            if let Some(payload) = messages::post_direct(state, sender, receiver, text).await {
                // The sender sees its own DM through this echo, not a subscription
                send_text(&conn.tx, payload);
            }
        }
    }
}

async fn handle_join(name: &str, conn: &mut ConnectionContext, state: &AppState) {
    if !presence::join(state, conn.id, name).await {
        return;
    }

    // Subscribe before acknowledging so DMs sent after the welcome arrive
    match listeners::spawn_direct_listener(state, conn.id, name, conn.tx.clone()).await {
        Ok(listener) => conn.replace_direct_listener(listener),
        Err(e) => {
            conn.stop_direct_listener();
            tracing::warn!(
                connection_id = %conn.id,
                username = %name,
                error = %e,
                "Failed to subscribe to direct topic"
            );
        }
    }

    send_text(&conn.tx, welcome_text(name));
}
