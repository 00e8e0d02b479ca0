use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;

use colabri_session::auth::identity::{issue_token, IdentityClaims};
use colabri_session::config::Config;
use colabri_session::{build_app, AppState};

const SECRET: &str = "rest-api-test-secret";

fn app() -> Router {
    let config = Config {
        auth_jwt_secret: Some(SECRET.to_string()),
        ..Config::default()
    };
    build_app(AppState::in_memory(config))
}

fn token(sub: &str, roles: &[&str]) -> String {
    let claims = IdentityClaims {
        sub: sub.to_string(),
        name: format!("{} name", sub),
        email: Some(format!("{}@example.com", sub)),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        exp: Utc::now().timestamp() + 3600,
    };
    issue_token(SECRET, &claims).unwrap()
}

async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_is_public_and_api_requires_credentials() {
    let app = app();

    let (status, body) = call(&app, Method::GET, "/api/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call(&app, Method::GET, "/api/v1/documents", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);

    let (status, _) = call(&app, Method::GET, "/api/v1/documents", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn owner_rename_is_visible_and_collaborator_rename_is_forbidden() {
    let app = app();
    let alice = token("alice", &[]);
    let bob = token("bob", &[]);

    // Bob has to be known before he can be added by e-mail
    let (status, _) = call(&app, Method::GET, "/api/v1/documents", Some(&bob), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, doc) = call(
        &app,
        Method::POST,
        "/api/v1/documents",
        Some(&alice),
        Some(json!({ "title": "Draft", "type": "text" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(doc["ownerId"], "alice");
    let id = doc["id"].as_str().unwrap().to_string();
    let doc_uri = format!("/api/v1/documents/{}", id);

    let (status, collaborators) = call(
        &app,
        Method::POST,
        &format!("{}/collaborators", doc_uri),
        Some(&alice),
        Some(json!({ "email": "BOB@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(collaborators["collaboratorIds"], json!(["alice", "bob"]));

    let (status, renamed) = call(&app, Method::PUT, &doc_uri, Some(&alice), Some(json!({ "title": "Final" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["title"], "Final");

    let (status, seen_by_bob) = call(&app, Method::GET, &doc_uri, Some(&bob), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(seen_by_bob["title"], "Final");

    let (status, body) = call(&app, Method::PUT, &doc_uri, Some(&bob), Some(json!({ "title": "Mine now" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], 403);

    let (_, unchanged) = call(&app, Method::GET, &doc_uri, Some(&alice), None).await;
    assert_eq!(unchanged["title"], "Final");
}

#[tokio::test]
async fn outsiders_and_unknown_documents_are_told_apart() {
    let app = app();
    let alice = token("alice", &[]);
    let mallory = token("mallory", &[]);

    let (_, doc) = call(&app, Method::POST, "/api/v1/documents", Some(&alice), Some(json!({}))).await;
    assert_eq!(doc["title"], "Untitled");
    let doc_uri = format!("/api/v1/documents/{}", doc["id"].as_str().unwrap());

    let (status, _) = call(&app, Method::GET, &doc_uri, Some(&mallory), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let missing = format!("/api/v1/documents/{}", uuid::Uuid::new_v4());
    let (status, _) = call(&app, Method::GET, &missing, Some(&alice), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, Method::GET, "/api/v1/documents/not-a-uuid", Some(&alice), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["field"], "id");
}

#[tokio::test]
async fn comments_keep_their_range_and_reject_inverted_ones() {
    let app = app();
    let alice = token("alice", &[]);

    let (_, doc) = call(&app, Method::POST, "/api/v1/documents", Some(&alice), Some(json!({ "title": "Notes" }))).await;
    let id = doc["id"].as_str().unwrap().to_string();

    let (status, comment) = call(
        &app,
        Method::POST,
        "/api/v1/comments",
        Some(&alice),
        Some(json!({ "documentId": id, "text": "<i>check</i>", "rangeStart": 5, "rangeEnd": 10 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(comment["text"], "&lt;i&gt;check&lt;/i&gt;");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/comments",
        Some(&alice),
        Some(json!({ "documentId": id, "text": "backwards", "rangeStart": 10, "rangeEnd": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["field"], "rangeEnd");

    let (status, listed) = call(&app, Method::GET, &format!("/api/v1/comments/{}", id), Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["rangeStart"], 5);
    assert_eq!(listed[0]["rangeEnd"], 10);
}

#[tokio::test]
async fn delete_removes_the_document_and_its_comments() {
    let app = app();
    let alice = token("alice", &[]);

    let (_, doc) = call(&app, Method::POST, "/api/v1/documents", Some(&alice), Some(json!({ "type": "canvas" }))).await;
    assert_eq!(doc["type"], "canvas");
    let id = doc["id"].as_str().unwrap().to_string();
    let doc_uri = format!("/api/v1/documents/{}", id);

    let (status, content) = call(&app, Method::GET, &format!("{}/content?format=both", doc_uri), Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content["live"], false);
    assert!(content["binary"].is_string());

    let (status, body) = call(&app, Method::DELETE, &doc_uri, Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, _) = call(&app, Method::GET, &doc_uri, Some(&alice), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&app, Method::GET, &format!("/api/v1/comments/{}", id), Some(&alice), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn diagnostics_require_the_admin_role() {
    let app = app();

    let (status, _) = call(&app, Method::GET, "/api/v1/diagnostics", Some(&token("alice", &[])), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&app, Method::GET, "/api/v1/diagnostics", Some(&token("root", &["admin"])), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["registry"]["n_rooms"], 0);
    assert_eq!(body["n_cached_users"], 2);
}
