use tracing::{debug, warn};

use crate::websocket::handler::{send_message, WsSender};
use crate::ws::gateway::ActiveSession;
use crate::models::SendMessage;

/// Handle an operation - Apply, Log and Broadcast
pub async fn handle_operation_message(payload: Vec<u8>, session: &ActiveSession, sender: &WsSender) {
    let size = payload.len();
    match session.submit_operation(payload).await {
        Ok(revision) => {
            debug!("Operation of {} bytes applied on document {} (revision {})", size, session.document_id(), revision);
        }
        Err(e) => {
            // The connection stays open, the client is told why
            warn!("Operation rejected on session {}: {}", session.session_id(), e);
            let _ = send_message(sender, &SendMessage::Error(e.to_message())).await;
        }
    }
}
