use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use tracing::{debug, warn};

use crate::auth::extract_token;
use crate::models::ErrorResponse;
use crate::AppState;

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {

    // 1. Get the auth token from the request
    let token = extract_token(req.headers());

    // 2. Validate it; every failure looks the same to the caller
    let principal = match state.identity.authenticate(token.as_deref()).await {
        Ok(principal) => principal,
        Err(e) => {
            debug!("Request rejected: {}", e);
            return Err(ErrorResponse::new(StatusCode::UNAUTHORIZED, e.to_string()));
        }
    };

    // 3. Keep the user directory current for collaborator lookups
    if let Err(e) = state.documents.remember_user(&principal).await {
        warn!("Failed to record user {}: {}", principal.id, e);
    }

    // 4. Hand the principal to downstream handlers
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}
