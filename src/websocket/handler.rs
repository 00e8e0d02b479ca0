use std::sync::Arc;
use axum::{
    extract::{ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade}, Query, State},
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::AppState;
use crate::auth::extract_token;
use crate::models::{ErrorMessage, ReceivedMessage, SendMessage};
use crate::websocket::msg_operation_handler::handle_operation_message;
use crate::websocket::msg_ping_handler::handle_ping_message;
use crate::websocket::msg_presence_handler::handle_presence_message;
use crate::ws::gateway::{Handshake, SessionGateway};

pub type WsSender = Arc<Mutex<futures_util::stream::SplitSink<WebSocket, Message>>>;

/// Query parameters of the realtime endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub document_id: Option<String>,
    pub token: Option<String>,
}

/// WebSocket handler
pub async fn websocket_handler(
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    info!("New WebSocket connection attempt");
    // The query token wins, browsers cannot set headers on upgrades
    let handshake = Handshake {
        credential: params.token.or_else(|| extract_token(&headers)),
        document_id: params.document_id,
    };
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, handshake, gateway))
}

/// Serialize and send one message
pub async fn send_message(sender: &WsSender, msg: &SendMessage) -> Result<(), ()> {
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize outgoing message: {}", e);
            return Err(());
        }
    };
    sender.lock().await.send(Message::Text(text)).await.map_err(|_| ())
}

pub async fn send_error(sender: &WsSender, code: &str, message: impl Into<String>) {
    let msg = SendMessage::Error(ErrorMessage {
        code: code.to_string(),
        message: message.into(),
    });
    let _ = send_message(sender, &msg).await;
}

/// Handle WebSocket connection
async fn handle_socket(mut socket: WebSocket, handshake: Handshake, gateway: Arc<SessionGateway>) {

    // Authenticate, authorize and join before anything else is read
    let mut session = match gateway.open(handshake).await {
        Ok(session) => session,
        Err(reason) => {
            info!("WebSocket connection refused: {}", reason);
            let frame = CloseFrame {
                code: reason.close_code(),
                reason: reason.as_str().into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            return;
        }
    };
    let Some(mut events) = session.take_events() else {
        session.close().await;
        return;
    };
    let session = Arc::new(session);
    info!(
        "WebSocket session {} established for document {} ({})",
        session.session_id(),
        session.document_id(),
        session.principal().id
    );

    // Split the socket; both tasks below need the sender
    let (sender, mut receiver) = socket.split();
    let sender1: WsSender = Arc::new(Mutex::new(sender));
    let sender2 = sender1.clone();

    if send_message(&sender1, &session.init_message()).await.is_err() {
        session.close().await;
        return;
    }

    // Client -> room
    let session1 = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ReceivedMessage>(&text) {
                    Ok(ReceivedMessage::Operation(op_msg)) => {
                        handle_operation_message(op_msg.payload, &session1, &sender1).await;
                    }
                    Ok(ReceivedMessage::Presence(presence_msg)) => {
                        handle_presence_message(&presence_msg, &session1).await;
                    }
                    Ok(ReceivedMessage::Ping(ping_msg)) => {
                        handle_ping_message(&ping_msg, &session1, &sender1).await;
                    }
                    Err(e) => {
                        warn!("Failed to parse message on session {}: {}", session1.session_id(), e);
                        send_error(&sender1, "bad-message", "message could not be parsed").await;
                    }
                },
                // Binary frames carry raw operation payloads
                Message::Binary(bytes) => handle_operation_message(bytes, &session1, &sender1).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Room -> client
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = events.next().await {
            if send_message(&sender2, &msg).await.is_err() {
                return;
            }
        }
        let frame = CloseFrame {
            code: close_code::AWAY,
            reason: "room-closed".into(),
        };
        let _ = sender2.lock().await.send(Message::Close(Some(frame))).await;
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut recv_task) => send_task.abort(),
        _ = (&mut send_task) => recv_task.abort(),
    };
    session.close().await;
    info!("WebSocket session {} terminated", session.session_id());
}
