use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use uuid::Uuid;

use crate::chat::{messages, presence};
use crate::state::AppState;
use crate::ws::broadcast::send_event;
use crate::ws::protocol;
use crate::ws::{ConnectionContext, ConnectionSender};

/// What the reader loop observed next.
enum Inbound {
    Frame(Message),
    Error(axum::Error),
    Ended,
    Idle,
    WriterGone,
    PongTimeout,
    Overflow,
}

/// Run the actor-per-connection pattern for an accepted WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Ping task: probes liveness and finishes when a pong is overdue
/// - Reader loop: processes incoming frames in order, dispatches commands
///
/// The mpsc channel is the connection's only write path; listeners and
/// echoes clone the sender, so frames never interleave on the socket.
pub async fn run_connection(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let id = Uuid::new_v4();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = ConnectionSender::new(state.settings.outbound_capacity);

    // Read the snapshot before the connection is visible to fan-out, then
    // register and queue it without yielding so init is always frame one.
    let snapshot = messages::init_snapshot(&state).await;
    state.connections.register(id, tx.clone());
    send_event(&tx, &snapshot);

    tracing::info!(connection_id = %id, peer = %peer, "WebSocket actor started");

    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, pong_rx) = mpsc::unbounded_channel::<()>();
    let mut ping_handle = tokio::spawn(ping_task(
        tx.clone(),
        pong_rx,
        state.settings.ping_interval,
        state.settings.pong_timeout,
    ));

    let mut conn = ConnectionContext::new(id, tx.clone());
    let idle_timeout = state.settings.idle_timeout;

    loop {
        let inbound = tokio::select! {
            _ = &mut writer_handle => Inbound::WriterGone,
            _ = &mut ping_handle => Inbound::PongTimeout,
            _ = tx.overflowed() => Inbound::Overflow,
            inbound = read_frame(&mut ws_receiver, idle_timeout) => inbound,
        };

        match inbound {
            Inbound::Frame(msg) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_message(text.as_str(), &mut conn, &state).await;
                }
                Message::Binary(data) => {
                    tracing::debug!(
                        connection_id = %id,
                        bytes = data.len(),
                        "Ignoring binary frame"
                    );
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(connection_id = %id, reason = ?frame, "Client initiated close");
                    break;
                }
            },
            Inbound::Error(e) => {
                tracing::warn!(connection_id = %id, error = %e, "WebSocket receive error");
                break;
            }
            Inbound::Ended => {
                tracing::info!(connection_id = %id, "WebSocket stream ended");
                break;
            }
            Inbound::Idle => {
                tracing::info!(connection_id = %id, "Closing idle connection");
                break;
            }
            Inbound::WriterGone => {
                tracing::info!(connection_id = %id, "WebSocket writer stopped");
                break;
            }
            Inbound::PongTimeout => {
                tracing::warn!(connection_id = %id, "Peer stopped answering pings");
                break;
            }
            Inbound::Overflow => {
                tracing::warn!(connection_id = %id, "Outbound queue full, closing slow connection");
                break;
            }
        }
    }

    // Teardown: private listener first so nothing new is queued, then the
    // registry entry (announcing the leave if joined), then the socket tasks.
    conn.stop_direct_listener();
    ping_handle.abort();
    let username = presence::leave(&state, id).await;
    writer_handle.abort();

    tracing::info!(
        connection_id = %id,
        username = username.as_deref().unwrap_or(""),
        "WebSocket actor stopped"
    );
}

async fn read_frame(receiver: &mut SplitStream<WebSocket>, idle_timeout: Option<Duration>) -> Inbound {
    let next = match idle_timeout {
        Some(limit) => match timeout(limit, receiver.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::Idle,
        },
        None => receiver.next().await,
    };

    match next {
        Some(Ok(msg)) => Inbound::Frame(msg),
        Some(Err(e)) => Inbound::Error(e),
        None => Inbound::Ended,
    }
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(mut ws_sender: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // Socket is broken; the reader notices via the finished handle
            break;
        }
    }
}

/// Ping task: sends periodic pings and returns when a pong does not come
/// back in time. The reader loop treats its completion as the end of the
/// connection.
async fn ping_task(
    tx: ConnectionSender,
    mut pong_rx: mpsc::UnboundedReceiver<()>,
    ping_interval: Duration,
    pong_timeout: Duration,
) {
    let mut ping_timer = interval(ping_interval);
    // Skip the first immediate tick
    ping_timer.tick().await;

    loop {
        ping_timer.tick().await;

        // Drop pongs that answered earlier pings
        while pong_rx.try_recv().is_ok() {}

        if !tx.send(Message::Ping(vec![1, 2, 3, 4].into())) {
            // Writer gone or queue full; the reader tears down either way
            return;
        }

        match timeout(pong_timeout, pong_rx.recv()).await {
            Ok(Some(())) => {}
            _ => {
                tracing::warn!("Pong timeout, closing connection");
                tx.send(Message::Close(Some(CloseFrame {
                    code: 1001,
                    reason: "Pong timeout".into(),
                })));
                return;
            }
        }
    }
}
