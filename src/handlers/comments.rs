use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};

use super::api_error;
use crate::auth::Principal;
use crate::models::{CommentResponse, CreateCommentRequest, ErrorResponse};
use crate::AppState;

/// Anchor a comment to a text range
pub async fn create_comment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateCommentRequest>,
) -> Result<(StatusCode, Json<CommentResponse>), (StatusCode, Json<ErrorResponse>)> {
    let comment = state.comments.create(&principal, req).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(comment.into())))
}

/// Comments of a document, oldest first
pub async fn list_comments(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(doc_id): Path<String>,
) -> Result<(StatusCode, Json<Vec<CommentResponse>>), (StatusCode, Json<ErrorResponse>)> {
    let comments = state
        .comments
        .list_by_document(&principal, &doc_id)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::OK, Json(comments.into_iter().map(CommentResponse::from).collect())))
}
