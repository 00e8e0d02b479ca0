use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};

use super::{api_error, parse_doc_id};
use crate::auth::Principal;
use crate::models::{
    AddCollaboratorRequest, CollaboratorsResponse, CreateDocumentRequest, DocumentDeleteResponse, DocumentResponse,
    ErrorResponse, RenameDocumentRequest,
};
use crate::AppState;

type HandlerResult<T> = Result<(StatusCode, Json<T>), (StatusCode, Json<ErrorResponse>)>;

/// Create a document owned by the caller
pub async fn create_document(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateDocumentRequest>,
) -> HandlerResult<DocumentResponse> {
    let doc = state.documents.create(&principal, req).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(doc.into())))
}

/// Documents the caller collaborates on
pub async fn list_documents(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> HandlerResult<Vec<DocumentResponse>> {
    let docs = state.documents.list(&principal).await.map_err(api_error)?;
    Ok((StatusCode::OK, Json(docs.into_iter().map(DocumentResponse::from).collect())))
}

pub async fn get_document(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(doc_id): Path<String>,
) -> HandlerResult<DocumentResponse> {
    let doc_id = parse_doc_id(&doc_id)?;
    let doc = state.documents.get(&principal, doc_id).await.map_err(api_error)?;
    Ok((StatusCode::OK, Json(doc.into())))
}

pub async fn rename_document(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(doc_id): Path<String>,
    Json(req): Json<RenameDocumentRequest>,
) -> HandlerResult<DocumentResponse> {
    let doc_id = parse_doc_id(&doc_id)?;
    let doc = state.documents.rename(&principal, doc_id, req).await.map_err(api_error)?;
    Ok((StatusCode::OK, Json(doc.into())))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(doc_id): Path<String>,
) -> HandlerResult<DocumentDeleteResponse> {
    let doc_id = parse_doc_id(&doc_id)?;
    state.documents.delete(&principal, doc_id).await.map_err(api_error)?;
    Ok((StatusCode::OK, Json(DocumentDeleteResponse { success: true })))
}

pub async fn add_collaborator(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(doc_id): Path<String>,
    Json(req): Json<AddCollaboratorRequest>,
) -> HandlerResult<CollaboratorsResponse> {
    let doc_id = parse_doc_id(&doc_id)?;
    let doc = state
        .documents
        .add_collaborator(&principal, doc_id, &req.email)
        .await
        .map_err(api_error)?;
    Ok((
        StatusCode::OK,
        Json(CollaboratorsResponse {
            collaborator_ids: doc.collaborator_ids.into_iter().collect(),
        }),
    ))
}
