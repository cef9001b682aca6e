// src/api/ws/mod.rs
// WebSocket upgrade handler and receive loop

pub mod connection;
pub mod events;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

pub use connection::{ConnectionManager, SocketSink, WsSink};

use crate::api::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Upgrade `/ws?token=<session>` to a per-user event channel. The socket is
/// server-push only: client frames other than ping/close are ignored.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let Some(token) = query.token else {
        return ApiError::unauthorized("Missing session token").into_response();
    };

    let user = match state.auth_service.validate_session(&token).await {
        Ok(user) => user,
        Err(e) => {
            warn!("WebSocket upgrade rejected: {}", e);
            return ApiError::unauthorized("Invalid session").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user.id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let connection_start = Instant::now();
    let (sender, mut receiver) = socket.split();

    let sink: Arc<dyn WsSink> = Arc::new(SocketSink::new(sender));
    state.connection_manager.connect(&user_id, sink.clone()).await;
    info!("WebSocket client connected for user {}", user_id);

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) => {
                info!("Client initiated close for user {}", user_id);
                break;
            }
            // Pings are answered by the transport layer; text frames from
            // the client are not part of the protocol.
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error for user {}: {}", user_id, e);
                break;
            }
        }
    }

    state.connection_manager.disconnect(&user_id, &sink).await;
    info!(
        "WebSocket client disconnected for user {} after {:.2}s",
        user_id,
        connection_start.elapsed().as_secs_f64()
    );
}
