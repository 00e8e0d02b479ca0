use tracing::debug;

use crate::models::PresenceMessage;
use crate::ws::gateway::ActiveSession;

/// Handle PresenceMessage
pub async fn handle_presence_message(presence_msg: &PresenceMessage, session: &ActiveSession) {
    if !session.update_presence(presence_msg.cursor.clone()).await {
        debug!("Presence from session {} ignored, not in the room", session.session_id());
    }
}
