use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Response for an error
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
    /// Offending request field for validation errors
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub field: Option<String>,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
        (
            status,
            Json(ErrorResponse {
                code: status.as_u16(),
                status: status.to_string(),
                error: error.into(),
                field: None,
            }),
        )
    }
}

/// Missing, malformed or expired credential. Carries no detail.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unauthenticated")]
pub struct AuthError;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthzError {
    #[error("document not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("document has {0} active session(s)")]
    DocumentInUse(usize),
}

/// Everything a REST handler can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Authz(#[from] AuthzError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

impl From<ApiError> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Auth(e) => ErrorResponse::new(StatusCode::UNAUTHORIZED, e.to_string()),
            ApiError::Authz(AuthzError::NotFound) => {
                ErrorResponse::new(StatusCode::NOT_FOUND, "Document not found")
            }
            ApiError::Authz(AuthzError::Forbidden) => {
                ErrorResponse::new(StatusCode::FORBIDDEN, "User not authorized")
            }
            ApiError::Validation(e) => {
                let (status, mut body) = ErrorResponse::new(StatusCode::BAD_REQUEST, e.message);
                body.field = Some(e.field);
                (status, body)
            }
            // Storage details stay in the logs
            ApiError::Persistence(_) => {
                ErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "Storage error")
            }
            ApiError::Conflict(e) => ErrorResponse::new(StatusCode::CONFLICT, e.to_string()),
        }
    }
}
