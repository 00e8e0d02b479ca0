use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use uuid::Uuid;

use crate::auth::Permission;
use crate::models::DocKind;
use crate::ws::presence::{Cursor, Presence};

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OperationMessage {
    #[serde_as(as = "Base64")]
    pub payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PresenceMessage {
    pub cursor: Option<Cursor>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct PingMessage {}

/// Messages a client may send once its session is active
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ReceivedMessage {
    #[serde(rename = "operation")]
    Operation(OperationMessage),
    #[serde(rename = "presence")]
    Presence(PresenceMessage),
    #[serde(rename = "ping")]
    Ping(PingMessage),
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    pub document_id: Uuid,
    pub session_id: Uuid,
    pub kind: DocKind,
    pub permission: Permission,
    #[serde_as(as = "Base64")]
    pub snapshot: Vec<u8>,
    pub presences: Vec<Presence>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOperationMessage {
    pub document_id: Uuid,
    #[serde_as(as = "Base64")]
    pub payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PresenceLeftMessage {
    pub session_id: Uuid,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub document_id: Uuid,
    #[serde_as(as = "Base64")]
    pub snapshot: Vec<u8>,
    /// Replaces the receiver's view of its peers
    pub presences: Vec<Presence>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PongMessage {
    pub date: String,
}

/// Messages the server pushes to a client
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum SendMessage {
    #[serde(rename = "init")]
    Init(InitMessage),
    #[serde(rename = "operation")]
    Operation(RemoteOperationMessage),
    #[serde(rename = "presence")]
    Presence(Presence),
    #[serde(rename = "presence-left")]
    PresenceLeft(PresenceLeftMessage),
    #[serde(rename = "sync")]
    Sync(SyncMessage),
    #[serde(rename = "error")]
    Error(ErrorMessage),
    #[serde(rename = "pong")]
    Pong(PongMessage),
}
