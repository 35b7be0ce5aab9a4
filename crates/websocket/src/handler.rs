use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use crate::gate::{SessionGate, BUSY_REASON};

pub async fn ws_handler(ws: WebSocketUpgrade, State(gate): State<SessionGate>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, gate))
}

async fn handle_socket(socket: WebSocket, gate: SessionGate) {
    let (sender, mut receiver) = socket.split();

    let session_id = match gate.admit(Box::pin(sender)).await {
        Ok(id) => id,
        Err(mut sender) => {
            tracing::warn!("Client already connected, rejecting new connection");
            let frame = CloseFrame {
                code: close_code::AGAIN,
                reason: Utf8Bytes::from_static(BUSY_REASON),
            };
            let _ = sender.send(Message::Close(Some(frame))).await;
            let _ = sender.close().await;
            return;
        }
    };

    tracing::info!(session_id = %session_id, "Client connected");

    loop {
        tokio::select! {
            // Local close or a failed send already dropped the session.
            _ = gate.wait_released(session_id) => break,

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(session_id = %session_id, "Received message from client: {}", text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!(session_id = %session_id, "WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    gate.release(session_id).await;
    tracing::info!(session_id = %session_id, "Client disconnected");
}
