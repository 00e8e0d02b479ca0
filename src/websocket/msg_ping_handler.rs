use tracing::{debug, error};

use crate::models::PingMessage;
use crate::websocket::handler::{send_message, WsSender};
use crate::ws::gateway::{pong, ActiveSession};

/// Handle PingMessage
pub async fn handle_ping_message(_ping_msg: &PingMessage, session: &ActiveSession, sender: &WsSender) {
    debug!("Ping message received on session {}", session.session_id());

    // Reply with pong
    if send_message(sender, &pong()).await.is_err() {
        error!("Failed to send Pong message for document {}", session.document_id());
    }
}
