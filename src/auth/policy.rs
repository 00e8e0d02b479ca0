use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use super::Principal;
use crate::db::{DocumentRow, DocumentStore};
use crate::models::{ApiError, AuthzError, ErrorResponse};

/// Role granting access to operational endpoints
pub const ADMIN_ROLE: &str = "admin";

/// Access levels, ordered so that a higher level implies every lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Comment,
    Write,
    Owner,
}

/// Outcome of a successful authorization
#[derive(Debug, Clone)]
pub struct Grant {
    pub document: DocumentRow,
    pub permission: Permission,
}

/// Highest level a user holds on a document, if any
pub fn effective_permission(doc: &DocumentRow, user_id: &str) -> Option<Permission> {
    if doc.is_owner(user_id) {
        Some(Permission::Owner)
    } else if doc.collaborator_ids.contains(user_id) {
        Some(Permission::Write)
    } else {
        None
    }
}

/// Decides what a principal may do with a document. Always reads the current
/// collaborator set, so revocations apply to the next request or join.
pub struct AccessPolicy {
    documents: Arc<dyn DocumentStore>,
}

impl AccessPolicy {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }

    pub async fn authorize(
        &self,
        principal: &Principal,
        document_id: Uuid,
        required: Permission,
    ) -> Result<Grant, ApiError> {
        let document = self
            .documents
            .get_document(document_id)
            .await?
            .ok_or(AuthzError::NotFound)?;

        match effective_permission(&document, &principal.id) {
            Some(permission) if permission >= required => Ok(Grant { document, permission }),
            _ => Err(AuthzError::Forbidden.into()),
        }
    }
}

pub fn ensure_admin(principal: &Principal) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if principal.has_role(ADMIN_ROLE) {
        return Ok(());
    }
    Err(ErrorResponse::new(StatusCode::FORBIDDEN, "Admin access required"))
}
