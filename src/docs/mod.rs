use utoipa::OpenApi;
use crate::auth::Permission;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Service is ready", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Create a document
#[utoipa::path(
    post,
    path = "/api/v1/documents",
    request_body = CreateDocumentRequest,
    responses(
        (status = 201, description = "Document created", body = DocumentResponse),
        (status = 400, description = "Invalid title or type", body = ErrorResponse),
        (status = 401, description = "Unauthenticated", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn create_document_doc() {}

/// List the caller's documents, most recently updated first
#[utoipa::path(
    get,
    path = "/api/v1/documents",
    responses(
        (status = 200, description = "Documents", body = [DocumentResponse]),
        (status = 401, description = "Unauthenticated", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn list_documents_doc() {}

/// Get a document
#[utoipa::path(
    get,
    path = "/api/v1/documents/{doc_id}",
    params(("doc_id" = String, Path, description = "Document id")),
    responses(
        (status = 200, description = "Document", body = DocumentResponse),
        (status = 403, description = "Not a collaborator", body = ErrorResponse),
        (status = 404, description = "Unknown document", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn get_document_doc() {}

/// Rename a document (owner only)
#[utoipa::path(
    put,
    path = "/api/v1/documents/{doc_id}",
    params(("doc_id" = String, Path, description = "Document id")),
    request_body = RenameDocumentRequest,
    responses(
        (status = 200, description = "Renamed document", body = DocumentResponse),
        (status = 400, description = "Missing title", body = ErrorResponse),
        (status = 403, description = "Not the owner", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn rename_document_doc() {}

/// Delete a document (owner only)
#[utoipa::path(
    delete,
    path = "/api/v1/documents/{doc_id}",
    params(("doc_id" = String, Path, description = "Document id")),
    responses(
        (status = 200, description = "Document deleted", body = DocumentDeleteResponse),
        (status = 403, description = "Not the owner", body = ErrorResponse),
        (status = 409, description = "Sessions are still connected", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn delete_document_doc() {}

/// Share a document with a user by e-mail (owner only)
#[utoipa::path(
    post,
    path = "/api/v1/documents/{doc_id}/collaborators",
    params(("doc_id" = String, Path, description = "Document id")),
    request_body = AddCollaboratorRequest,
    responses(
        (status = 200, description = "Collaborators after the change", body = CollaboratorsResponse),
        (status = 400, description = "Unknown e-mail", body = ErrorResponse),
        (status = 403, description = "Not the owner", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn add_collaborator_doc() {}

/// Current document content
#[utoipa::path(
    get,
    path = "/api/v1/documents/{doc_id}/content",
    params(
        ("doc_id" = String, Path, description = "Document id"),
        ("format" = Option<String>, Query, description = "json, binary or both")
    ),
    responses(
        (status = 200, description = "Document content", body = DocumentContentResponse),
        (status = 403, description = "Not a collaborator", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn doc_content_doc() {}

/// Create a comment anchored to a text range
#[utoipa::path(
    post,
    path = "/api/v1/comments",
    request_body = CreateCommentRequest,
    responses(
        (status = 201, description = "Comment created", body = CommentResponse),
        (status = 400, description = "Invalid range or text", body = ErrorResponse),
        (status = 403, description = "Not a collaborator", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn create_comment_doc() {}

/// List the comments of a document in creation order
#[utoipa::path(
    get,
    path = "/api/v1/comments/{doc_id}",
    params(("doc_id" = String, Path, description = "Document id")),
    responses(
        (status = 200, description = "Comments", body = [CommentResponse]),
        (status = 403, description = "Not a collaborator", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn list_comments_doc() {}

/// Registry and host diagnostics (admin only)
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Diagnostics", body = DiagnosticsResponse),
        (status = 403, description = "Admin role required", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        create_document_doc,
        list_documents_doc,
        get_document_doc,
        rename_document_doc,
        delete_document_doc,
        add_collaborator_doc,
        doc_content_doc,
        create_comment_doc,
        list_comments_doc,
        diagnostics_doc,
    ),
    components(
        schemas(
            HealthResponse,
            ErrorResponse,
            DocKind,
            Permission,
            CreateDocumentRequest,
            RenameDocumentRequest,
            AddCollaboratorRequest,
            DocumentResponse,
            CollaboratorsResponse,
            DocumentDeleteResponse,
            DocumentContentResponse,
            CreateCommentRequest,
            CommentResponse,
            RegistryStats,
            DiagnosticsResponse,
        )
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
