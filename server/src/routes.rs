use axum::{extract::State, routing::get, Json, Router};

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// GET /health: liveness plus the number of local connections.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.connections.len(),
    }))
}

/// Build the axum Router. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`; the WebSocket
/// handler reads the peer address.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
}
