pub mod comments;
pub mod diagnostics;
pub mod doc_content;
pub mod documents;
pub mod health;

pub use comments::*;
pub use diagnostics::*;
pub use doc_content::*;
pub use documents::*;
pub use health::*;

use axum::{http::StatusCode, Json};
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::{ApiError, ErrorResponse, ValidationError};

/// Log and convert a service error into the response tuple
pub fn api_error(err: ApiError) -> (StatusCode, Json<ErrorResponse>) {
    match &err {
        ApiError::Persistence(e) => error!("Storage failure: {}", e),
        other => debug!("Request rejected: {}", other),
    }
    err.into()
}

/// Parse a document id path segment
pub fn parse_doc_id(doc_id: &str) -> Result<Uuid, (StatusCode, Json<ErrorResponse>)> {
    Uuid::parse_str(doc_id.trim())
        .map_err(|_| api_error(ValidationError::new("id", format!("Invalid document id '{}'", doc_id)).into()))
}
