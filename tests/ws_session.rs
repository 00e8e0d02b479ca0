use std::net::SocketAddr;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use loro::{ExportMode, LoroDoc};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use colabri_session::auth::identity::{issue_token, IdentityClaims};
use colabri_session::auth::Principal;
use colabri_session::config::Config;
use colabri_session::models::CreateDocumentRequest;
use colabri_session::{build_app, AppState};

const SECRET: &str = "ws-session-test-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn principal(id: &str) -> Principal {
    Principal {
        id: id.to_string(),
        display_name: format!("{} name", id),
        email: Some(format!("{}@example.com", id)),
        roles: Vec::new(),
    }
}

fn token(sub: &str, ttl_secs: i64) -> String {
    let claims = IdentityClaims {
        sub: sub.to_string(),
        name: format!("{} name", sub),
        email: Some(format!("{}@example.com", sub)),
        roles: Vec::new(),
        exp: Utc::now().timestamp() + ttl_secs,
    };
    issue_token(SECRET, &claims).unwrap()
}

/// Serve the app on an ephemeral port. Returns the address and a shared
/// document alice owns and bob collaborates on.
async fn start() -> (SocketAddr, AppState, Uuid) {
    let config = Config {
        auth_jwt_secret: Some(SECRET.to_string()),
        ..Config::default()
    };
    let state = AppState::in_memory(config);

    let alice = principal("alice");
    let bob = principal("bob");
    state.documents.remember_user(&bob).await.unwrap();
    let doc = state
        .documents
        .create(
            &alice,
            CreateDocumentRequest {
                title: Some("Shared".to_string()),
                kind: None,
            },
        )
        .await
        .unwrap();
    state.documents.add_collaborator(&alice, doc.id, "bob@example.com").await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state, doc.id)
}

async fn connect(addr: SocketAddr, doc_id: Uuid, token: &str) -> Client {
    let url = format!("ws://{}/ws?documentId={}&token={}", addr, doc_id, token);
    let (client, _) = connect_async(url).await.unwrap();
    client
}

/// Next JSON message, skipping transport frames
async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string().into())).await.unwrap();
}

fn text_update(doc: &LoroDoc, pos: usize, text: &str) -> Vec<u8> {
    let before = doc.oplog_vv();
    doc.get_text("content").insert(pos, text).unwrap();
    doc.commit();
    doc.export(ExportMode::updates(&before)).unwrap()
}

#[tokio::test]
async fn operations_reach_other_sessions_but_not_the_sender() {
    let (addr, _state, doc_id) = start().await;

    let mut alice = connect(addr, doc_id, &token("alice", 3600)).await;
    let init = next_json(&mut alice).await;
    assert_eq!(init["type"], "init");
    assert_eq!(init["documentId"], doc_id.to_string());
    assert_eq!(init["permission"], "owner");

    let mut bob = connect(addr, doc_id, &token("bob", 3600)).await;
    let bob_init = next_json(&mut bob).await;
    assert_eq!(bob_init["type"], "init");
    assert_eq!(bob_init["permission"], "write");
    assert_eq!(bob_init["presences"][0]["userId"], "alice");

    let joined = next_json(&mut alice).await;
    assert_eq!(joined["type"], "presence");
    assert_eq!(joined["sessionId"], bob_init["sessionId"]);

    let editor = LoroDoc::new();
    let update = text_update(&editor, 0, "hello");
    send_json(
        &mut alice,
        json!({ "type": "operation", "payload": general_purpose::STANDARD.encode(&update) }),
    )
    .await;

    let relayed = next_json(&mut bob).await;
    assert_eq!(relayed["type"], "operation");
    let payload = general_purpose::STANDARD.decode(relayed["payload"].as_str().unwrap()).unwrap();
    let replica = LoroDoc::new();
    replica.import(&payload).unwrap();
    assert_eq!(replica.get_text("content").to_string(), "hello");

    // Alice's own operation is not echoed: the pong comes first
    send_json(&mut alice, json!({ "type": "ping" })).await;
    assert_eq!(next_json(&mut alice).await["type"], "pong");

    bob.close(None).await.unwrap();
    let left = next_json(&mut alice).await;
    assert_eq!(left["type"], "presence-left");
    assert_eq!(left["sessionId"], bob_init["sessionId"]);
}

#[tokio::test]
async fn expired_credential_is_closed_as_unauthenticated() {
    let (addr, state, doc_id) = start().await;

    let mut client = connect(addr, doc_id, &token("alice", -60)).await;
    let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended")
        .unwrap();
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4401);
            assert_eq!(frame.reason.as_str(), "unauthenticated");
        }
        other => panic!("expected a close frame, got {:?}", other),
    }

    // No room was created for the refused connection
    assert!(state.registry.room(doc_id).await.is_none());
}

#[tokio::test]
async fn unknown_document_and_malformed_id_are_refused() {
    let (addr, _state, _doc_id) = start().await;
    let alice = token("alice", 3600);

    let mut client = connect(addr, Uuid::new_v4(), &alice).await;
    match client.next().await {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 4404),
        other => panic!("expected a close frame, got {:?}", other),
    }

    let url = format!("ws://{}/ws?documentId=not-a-uuid&token={}", addr, alice);
    let (mut client, _) = connect_async(url).await.unwrap();
    match client.next().await {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 4400),
        other => panic!("expected a close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn invalid_operation_is_reported_and_the_session_stays_open() {
    let (addr, _state, doc_id) = start().await;

    let mut alice = connect(addr, doc_id, &token("alice", 3600)).await;
    assert_eq!(next_json(&mut alice).await["type"], "init");

    client_send_binary(&mut alice, b"not a loro update".to_vec()).await;
    let error = next_json(&mut alice).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "invalid-operation");

    send_json(&mut alice, json!({ "type": "ping" })).await;
    assert_eq!(next_json(&mut alice).await["type"], "pong");
}

async fn client_send_binary(client: &mut Client, bytes: Vec<u8>) {
    client.send(Message::Binary(bytes.into())).await.unwrap();
}
