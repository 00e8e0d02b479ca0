use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::{AccessPolicy, Permission, Principal};
use crate::db::{CommentRow, CommentStore};
use crate::models::{ApiError, CreateCommentRequest, ValidationError};

/// Comment threads anchored to `[rangeStart, rangeEnd)` offsets captured at
/// creation. Offsets are not rebased when the document changes afterwards.
pub struct CommentService {
    comments: Arc<dyn CommentStore>,
    policy: Arc<AccessPolicy>,
    max_len: usize,
}

impl CommentService {
    pub fn new(comments: Arc<dyn CommentStore>, policy: Arc<AccessPolicy>, max_len: usize) -> Self {
        Self {
            comments,
            policy,
            max_len,
        }
    }

    pub async fn create(&self, principal: &Principal, req: CreateCommentRequest) -> Result<CommentRow, ApiError> {
        let document_id = parse_document_id(&req.document_id)?;
        self.policy.authorize(principal, document_id, Permission::Comment).await?;

        let (range_start, range_end) = validate_range(req.range_start, req.range_end)?;
        let text = req.text.trim();
        if text.is_empty() {
            return Err(ValidationError::new("text", "Comment text is required").into());
        }
        if text.chars().count() > self.max_len {
            return Err(ValidationError::new("text", format!("Comment text exceeds {} characters", self.max_len)).into());
        }

        let comment = CommentRow {
            id: Uuid::new_v4(),
            document_id,
            author_id: principal.id.clone(),
            author_name: principal.display_name.clone(),
            text: escape_html(text),
            range_start,
            range_end,
            created_at: Utc::now(),
        };
        self.comments.insert_comment(&comment).await?;
        info!("Comment {} added to document {} by {}", comment.id, document_id, principal.id);
        Ok(comment)
    }

    /// Creation order
    pub async fn list_by_document(&self, principal: &Principal, document_id: &str) -> Result<Vec<CommentRow>, ApiError> {
        let document_id = parse_document_id(document_id)?;
        self.policy.authorize(principal, document_id, Permission::Read).await?;
        Ok(self.comments.list_comments(document_id).await?)
    }
}

fn parse_document_id(value: &str) -> Result<Uuid, ValidationError> {
    Uuid::parse_str(value.trim()).map_err(|_| ValidationError::new("documentId", "Invalid document id"))
}

fn validate_range(start: i64, end: i64) -> Result<(u32, u32), ValidationError> {
    if start < 0 {
        return Err(ValidationError::new("rangeStart", "rangeStart must not be negative"));
    }
    if start > end {
        return Err(ValidationError::new("rangeEnd", "rangeStart must not exceed rangeEnd"));
    }
    let end = u32::try_from(end).map_err(|_| ValidationError::new("rangeEnd", "rangeEnd is out of range"))?;
    Ok((start as u32, end))
}

/// Escape text for safe embedding in HTML
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}
