use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::CommentRow;

/// Request payload for anchoring a comment to a text range.
/// Ranges are signed so that negative offsets reach validation instead of
/// failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateCommentRequest {
    pub document_id: String,
    #[serde(alias = "commentText")]
    pub text: String,
    pub range_start: i64,
    pub range_end: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommentResponse {
    pub id: Uuid,
    pub document_id: Uuid,
    pub author_id: String,
    pub author_name: String,
    /// HTML-escaped comment text
    pub text: String,
    pub range_start: u32,
    pub range_end: u32,
    pub created_at: DateTime<Utc>,
}

impl From<CommentRow> for CommentResponse {
    fn from(row: CommentRow) -> Self {
        Self {
            id: row.id,
            document_id: row.document_id,
            author_id: row.author_id,
            author_name: row.author_name,
            text: row.text,
            range_start: row.range_start,
            range_end: row.range_end,
            created_at: row.created_at,
        }
    }
}
