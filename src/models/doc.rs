use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::DocumentRow;

/// What a document's replicated state holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DocKind {
    /// Rich text, also accepted as "document"
    #[serde(alias = "document")]
    Text,
    /// Drawing canvas, also accepted as "whiteboard"
    #[serde(alias = "whiteboard")]
    Canvas,
}

impl DocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::Text => "text",
            DocKind::Canvas => "canvas",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "text" | "document" => Some(DocKind::Text),
            "canvas" | "whiteboard" => Some(DocKind::Canvas),
            _ => None,
        }
    }
}

/// Request payload for creating a document
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct CreateDocumentRequest {
    pub title: Option<String>,
    #[serde(rename = "type", alias = "kind")]
    pub kind: Option<String>,
}

/// Request payload for renaming a document
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RenameDocumentRequest {
    pub title: Option<String>,
}

/// Request payload for sharing a document
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AddCollaboratorRequest {
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResponse {
    pub id: Uuid,
    pub owner_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: DocKind,
    pub collaborator_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DocumentRow> for DocumentResponse {
    fn from(row: DocumentRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            title: row.title,
            kind: row.kind,
            collaborator_ids: row.collaborator_ids.into_iter().collect(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorsResponse {
    pub collaborator_ids: Vec<String>,
}

/// Response returned after deleting a document
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DocumentDeleteResponse {
    pub success: bool,
}

/// Current content of a document
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DocumentContentResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
    /// Base64 Loro snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(rename = "type")]
    pub kind: DocKind,
    /// Served from a resident room rather than storage
    pub live: bool,
}
