//! WebSocket signaling endpoint
//!
//! One socket is one peer. Frames are JSON text; every request is handled in
//! its own task so a slow media engine call never delays reading the socket,
//! and a disconnect is processed as soon as it is seen.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use huddle_sfu::{ClientMessage, PeerId, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::server::AppState;

pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max_message_size = state.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let coordinator = Arc::clone(&state.coordinator);
    let peer_id = PeerId::new(nanoid::nanoid!());

    let mut events = match coordinator.connect_peer(peer_id.clone()) {
        Ok(events) => events,
        Err(e) => {
            warn!(peer_id = %peer_id, error = %e, "Refusing signaling connection");
            return;
        }
    };
    info!(peer_id = %peer_id, "WebSocket connection established");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Notifications and responses share the socket through this task.
    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(event) = events.recv() => ServerMessage::Event(event),
                Some(reply) = reply_rx.recv() => reply,
                else => break,
            };
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!(peer_id = %writer_peer, error = %e, "Failed to encode server message");
                    continue;
                }
            };
            if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                debug!(peer_id = %writer_peer, error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            () = state.closing.cancelled() => break,
            frame = ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => match ClientMessage::decode(text.as_str()) {
                Ok(message) => {
                    let coordinator = Arc::clone(&coordinator);
                    let reply_tx = reply_tx.clone();
                    let peer_id = peer_id.clone();
                    tokio::spawn(async move {
                        let result = coordinator.handle(&peer_id, message.request).await;
                        // The peer may be gone by now; the reply is simply dropped.
                        let _ = reply_tx.send(ServerMessage::reply(message.id, result));
                    });
                }
                Err(e) => {
                    debug!(peer_id = %peer_id, error = %e, "Undecodable signaling frame");
                    let _ = reply_tx.send(ServerMessage::failure(0, "invalid_request", e.to_string()));
                }
            },
            Some(Ok(Message::Binary(_))) => {
                let _ = reply_tx.send(ServerMessage::failure(
                    0,
                    "invalid_request",
                    "binary frames are not supported",
                ));
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(peer_id = %peer_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    coordinator.remove_peer(&peer_id).await;
    writer.abort();
    info!(peer_id = %peer_id, "WebSocket connection closed");
}
