use axum::{middleware, routing::{get, post}, Router};

use crate::handlers::{
    add_collaborator, create_comment, create_document, delete_document, diagnostics, doc_content, get_document,
    health_check, list_comments, list_documents, ready_check, rename_document,
};
use crate::routes::auth_middleware::auth_middleware;
use crate::AppState;

/// Create API routes
pub fn create_api_routes(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/documents", post(create_document).get(list_documents))
        .route(
            "/v1/documents/:doc_id",
            get(get_document).put(rename_document).delete(delete_document),
        )
        .route("/v1/documents/:doc_id/collaborators", post(add_collaborator))
        .route("/v1/documents/:doc_id/content", get(doc_content))
        .route("/v1/comments", post(create_comment))
        .route("/v1/comments/:doc_id", get(list_comments))
        .route("/v1/diagnostics", get(diagnostics))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware)); // Applies to all routes added above

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .merge(protected)
        .with_state(state)
}
