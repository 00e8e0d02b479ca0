use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use super::presence::Cursor;
use super::registry::{Membership, OperationError, RoomError, RoomRegistry};
use super::room::{Room, RoomEvent, SessionEntry, SessionId};
use crate::auth::{AccessPolicy, IdentityGate, Permission, Principal};
use crate::config::Config;
use crate::models::{
    ApiError, AuthzError, DocKind, ErrorMessage, InitMessage, PresenceLeftMessage, RemoteOperationMessage, SendMessage,
    SyncMessage, ValidationError,
};

/// Per-connection lifecycle. Any state before `Active` may go straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Authorizing,
    Joining,
    Active,
    Closing,
    Closed,
}

/// Why a connection was refused
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("bad-request")]
    BadRequest,
    #[error("not-found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("service-unavailable")]
    ServiceUnavailable,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Unauthenticated => "unauthenticated",
            CloseReason::BadRequest => "bad-request",
            CloseReason::NotFound => "not-found",
            CloseReason::Forbidden => "forbidden",
            CloseReason::ServiceUnavailable => "service-unavailable",
        }
    }

    /// Application close code sent in the close frame
    pub fn close_code(&self) -> u16 {
        match self {
            CloseReason::Unauthenticated => 4401,
            CloseReason::BadRequest => 4400,
            CloseReason::NotFound => 4404,
            CloseReason::Forbidden => 4403,
            CloseReason::ServiceUnavailable => 4503,
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("read-only session")]
    Forbidden,
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("session is closed")]
    Closed,
}

impl SubmitError {
    pub fn to_message(&self) -> ErrorMessage {
        let code = match self {
            SubmitError::Forbidden => "forbidden",
            SubmitError::Invalid(_) => "invalid-operation",
            SubmitError::Closed => "closed",
        };
        ErrorMessage {
            code: code.to_string(),
            message: self.to_string(),
        }
    }
}

/// What the client presented when connecting
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub credential: Option<String>,
    pub document_id: Option<String>,
}

/// Admits connections into rooms.
pub struct SessionGateway {
    identity: Arc<IdentityGate>,
    policy: Arc<AccessPolicy>,
    registry: Arc<RoomRegistry>,
    auth_timeout: Duration,
    /// Bounds the whole Joining phase, retries included
    join_timeout: Duration,
    join_max_attempts: u32,
}

impl SessionGateway {
    pub fn new(
        identity: Arc<IdentityGate>,
        policy: Arc<AccessPolicy>,
        registry: Arc<RoomRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            identity,
            policy,
            registry,
            auth_timeout: config.auth_timeout(),
            join_timeout: config.join_timeout(),
            join_max_attempts: config.join_max_attempts.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Run the handshake up to `Active`.
    pub async fn open(&self, handshake: Handshake) -> Result<ActiveSession, CloseReason> {
        let mut state = SessionState::Connecting;
        let result = self.admit(handshake, &mut state).await;
        if let Err(reason) = &result {
            debug!("Session refused in state {:?}: {}", state, reason);
        }
        result
    }

    async fn admit(&self, handshake: Handshake, state: &mut SessionState) -> Result<ActiveSession, CloseReason> {
        transition(state, SessionState::Authenticating);
        let principal = tokio::time::timeout(
            self.auth_timeout,
            self.identity.authenticate(handshake.credential.as_deref()),
        )
        .await
        .map_err(|_| CloseReason::Unauthenticated)?
        .map_err(|_| CloseReason::Unauthenticated)?;

        transition(state, SessionState::Authorizing);
        let document_id = handshake
            .document_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id.trim()).ok())
            .ok_or(CloseReason::BadRequest)?;
        let grant = self
            .policy
            .authorize(&principal, document_id, Permission::Read)
            .await
            .map_err(|e| match e {
                ApiError::Authz(AuthzError::NotFound) => CloseReason::NotFound,
                ApiError::Authz(AuthzError::Forbidden) => CloseReason::Forbidden,
                other => {
                    warn!("Authorization of {} on {} failed: {}", principal.id, document_id, other);
                    CloseReason::ServiceUnavailable
                }
            })?;

        transition(state, SessionState::Joining);
        let entry = SessionEntry::new(principal, grant.permission);
        let membership = tokio::time::timeout(
            self.join_timeout,
            self.join_room(document_id, grant.document.kind, &entry),
        )
        .await
        .map_err(|_| {
            warn!("Join of {} timed out after {:?}", document_id, self.join_timeout);
            CloseReason::ServiceUnavailable
        })??;

        transition(state, SessionState::Active);
        let init = InitMessage {
            document_id,
            session_id: entry.session_id,
            kind: grant.document.kind,
            permission: grant.permission,
            snapshot: membership.snapshot,
            presences: membership.presences,
        };
        let events = SessionEvents {
            room: membership.room.clone(),
            session_id: entry.session_id,
            rx: membership.events,
        };

        Ok(ActiveSession {
            registry: self.registry.clone(),
            room: membership.room,
            session_id: entry.session_id,
            principal: entry.principal,
            permission: grant.permission,
            init,
            events: Some(events),
            closed: AtomicBool::new(false),
        })
    }

    async fn join_room(&self, document_id: Uuid, kind: DocKind, entry: &SessionEntry) -> Result<Membership, CloseReason> {
        let mut attempt = 1;
        loop {
            let joined = match self.registry.acquire_room(document_id, kind).await {
                Ok(lease) => self.registry.join(lease, entry.clone()).await,
                Err(e) => Err(e),
            };
            match joined {
                Ok(membership) => return Ok(membership),
                Err(RoomError::Unavailable) => return Err(CloseReason::ServiceUnavailable),
                // Deleted after authorization
                Err(RoomError::NotFound) => return Err(CloseReason::NotFound),
                // A room closing underneath us is retried against its successor
                Err(e) if attempt < self.join_max_attempts => {
                    debug!("Join of {} failed (attempt {}): {}", document_id, attempt, e);
                    attempt += 1;
                }
                Err(_) => return Err(CloseReason::ServiceUnavailable),
            }
        }
    }
}

fn transition(state: &mut SessionState, next: SessionState) {
    debug!("Session {:?} -> {:?}", state, next);
    *state = next;
}

/// A joined session. Leaves the room on [`ActiveSession::close`] or on drop.
pub struct ActiveSession {
    registry: Arc<RoomRegistry>,
    room: Arc<Room>,
    session_id: SessionId,
    principal: Principal,
    permission: Permission,
    init: InitMessage,
    events: Option<SessionEvents>,
    closed: AtomicBool,
}

impl ActiveSession {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn document_id(&self) -> Uuid {
        self.room.doc_id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::SeqCst) {
            SessionState::Closed
        } else {
            SessionState::Active
        }
    }

    pub fn init_message(&self) -> SendMessage {
        SendMessage::Init(self.init.clone())
    }

    /// The session's event stream; can be taken once.
    pub fn take_events(&mut self) -> Option<SessionEvents> {
        self.events.take()
    }

    pub async fn submit_operation(&self, payload: Vec<u8>) -> Result<u64, SubmitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError::Closed);
        }
        if self.permission < Permission::Write {
            return Err(SubmitError::Forbidden);
        }
        self.registry
            .apply_operation(&self.room, self.session_id, payload)
            .await
            .map_err(|e| match e {
                OperationError::Invalid(e) => SubmitError::Invalid(e),
                OperationError::NotJoined => SubmitError::Closed,
            })
    }

    pub async fn update_presence(&self, cursor: Option<Cursor>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.registry.update_presence(&self.room, self.session_id, cursor).await
    }

    /// Leave the room. Returns false if the session was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("Session {} -> {:?}", self.session_id, SessionState::Closing);
        self.registry.leave(&self.room, self.session_id).await;
        debug!("Session {} -> {:?}", self.session_id, SessionState::Closed);
        true
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = self.registry.clone();
        let room = self.room.clone();
        let session_id = self.session_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.leave(&room, session_id).await;
            });
        }
    }
}

/// Room events as seen by one session: its own operations and presence are
/// filtered out, and a lagging receiver is resynchronised with a snapshot.
pub struct SessionEvents {
    room: Arc<Room>,
    session_id: SessionId,
    rx: broadcast::Receiver<RoomEvent>,
}

impl SessionEvents {
    /// `None` once the room is gone
    pub async fn next(&mut self) -> Option<SendMessage> {
        loop {
            match self.rx.recv().await {
                Ok(RoomEvent::Operation { origin, payload }) => {
                    if origin == self.session_id {
                        continue;
                    }
                    return Some(SendMessage::Operation(RemoteOperationMessage {
                        document_id: self.room.doc_id,
                        payload: payload.to_vec(),
                    }));
                }
                Ok(RoomEvent::Presence(presence)) => {
                    if presence.session_id == self.session_id {
                        continue;
                    }
                    return Some(SendMessage::Presence(presence));
                }
                Ok(RoomEvent::PresenceLeft { session_id }) => {
                    if session_id == self.session_id {
                        continue;
                    }
                    return Some(SendMessage::PresenceLeft(PresenceLeftMessage { session_id }));
                }
                Ok(RoomEvent::Closed) | Err(RecvError::Closed) => return None,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Session {} lagged {} event(s) behind on document {}, resyncing",
                        self.session_id, skipped, self.room.doc_id
                    );
                    // Presence and leave notices were skipped too, so the
                    // client replaces its view of peers along with the document
                    return match self.room.resync_state().await {
                        Some(Ok((snapshot, presences))) => Some(SendMessage::Sync(SyncMessage {
                            document_id: self.room.doc_id,
                            snapshot,
                            presences: presences
                                .into_iter()
                                .filter(|p| p.session_id != self.session_id)
                                .collect(),
                        })),
                        _ => None,
                    };
                }
            }
        }
    }
}

pub fn pong() -> SendMessage {
    SendMessage::Pong(crate::models::PongMessage {
        date: Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::identity::testing::{expired_token, gate, token};
    use crate::db::memory::testing::FaultyStore;
    use crate::db::{DocumentRow, DocumentStore};
    use crate::models::lorodoc::testing::ClientReplica;
    use crate::models::lorodoc::ReplicatedDoc;
    use crate::models::DocKind;
    use crate::ws::registry::testing::{registry, wait_until_gone};

    struct Fixture {
        store: Arc<FaultyStore>,
        gateway: SessionGateway,
        doc: DocumentRow,
    }

    async fn fixture(kind: DocKind) -> Fixture {
        fixture_with(kind, &Config::default()).await
    }

    async fn fixture_with(kind: DocKind, config: &Config) -> Fixture {
        let store = Arc::new(FaultyStore::new());
        let mut doc = DocumentRow::new("alice", "Notes", kind);
        doc.collaborator_ids.insert("bob".to_string());
        store.insert_document(&doc).await.unwrap();

        let gateway = SessionGateway::new(
            Arc::new(gate()),
            Arc::new(AccessPolicy::new(store.clone())),
            registry(&store),
            config,
        );
        Fixture { store, gateway, doc }
    }

    fn handshake(credential: Option<String>, doc_id: Uuid) -> Handshake {
        Handshake {
            credential,
            document_id: Some(doc_id.to_string()),
        }
    }

    #[tokio::test]
    async fn refusals_map_to_terse_reasons() {
        let f = fixture(DocKind::Text).await;

        let reason = f.gateway.open(handshake(None, f.doc.id)).await.err();
        assert_eq!(reason, Some(CloseReason::Unauthenticated));

        let reason = f.gateway.open(handshake(Some(expired_token("alice")), f.doc.id)).await.err();
        assert_eq!(reason, Some(CloseReason::Unauthenticated));

        let bad = Handshake {
            credential: Some(token("alice", "Alice")),
            document_id: Some("not-a-uuid".to_string()),
        };
        assert_eq!(f.gateway.open(bad).await.err(), Some(CloseReason::BadRequest));

        let reason = f.gateway.open(handshake(Some(token("alice", "Alice")), Uuid::new_v4())).await.err();
        assert_eq!(reason, Some(CloseReason::NotFound));

        let reason = f.gateway.open(handshake(Some(token("mallory", "M")), f.doc.id)).await.err();
        assert_eq!(reason, Some(CloseReason::Forbidden));
        assert_eq!(CloseReason::Forbidden.close_code(), 4403);
    }

    // Two editors type concurrently and converge; a reconnecting reader sees the merged text.
    #[tokio::test]
    async fn concurrent_editors_converge() {
        let f = fixture(DocKind::Text).await;
        let mut alice = f.gateway.open(handshake(Some(token("alice", "Alice")), f.doc.id)).await.unwrap();
        let mut bob = f.gateway.open(handshake(Some(token("bob", "Bob")), f.doc.id)).await.unwrap();
        let mut alice_events = alice.take_events().unwrap();
        let mut bob_events = bob.take_events().unwrap();

        let alice_client = ClientReplica::new();
        let bob_client = ClientReplica::new();
        alice.submit_operation(alice_client.insert_text(0, "Hello")).await.unwrap();
        bob.submit_operation(bob_client.insert_text(0, "World")).await.unwrap();

        // alice first sees bob join, then his edit
        assert!(matches!(alice_events.next().await, Some(SendMessage::Presence(_))));
        let from_bob = match alice_events.next().await {
            Some(SendMessage::Operation(op)) => op.payload,
            other => panic!("unexpected {:?}", other),
        };
        let from_alice = match bob_events.next().await {
            Some(SendMessage::Operation(op)) => op.payload,
            other => panic!("unexpected {:?}", other),
        };

        let a = ReplicatedDoc::new(DocKind::Text);
        a.apply(&from_alice).unwrap();
        a.apply(&from_bob).unwrap();
        let b = ReplicatedDoc::new(DocKind::Text);
        b.apply(&from_bob).unwrap();
        b.apply(&from_alice).unwrap();
        assert_eq!(a.text(), b.text());
        assert_eq!(a.text().len(), 10);

        alice.close().await;
        bob.close().await;
        wait_until_gone(f.gateway.registry(), f.doc.id).await;

        let mut carol = f.gateway.open(handshake(Some(token("alice", "Alice")), f.doc.id)).await.unwrap();
        let init = match carol.init_message() {
            SendMessage::Init(init) => init,
            other => panic!("unexpected {:?}", other),
        };
        let replica = ReplicatedDoc::from_snapshot(DocKind::Text, &init.snapshot).unwrap();
        assert_eq!(replica.text(), a.text());
        assert!(carol.take_events().is_some());
        assert!(carol.take_events().is_none());
    }

    #[tokio::test]
    async fn read_only_session_cannot_submit() {
        let f = fixture(DocKind::Text).await;
        let alice = f.gateway.open(handshake(Some(token("alice", "Alice")), f.doc.id)).await.unwrap();
        assert_eq!(alice.permission(), Permission::Owner);

        // Downgrade bob to a reader by making the session entry directly
        let lease = f.gateway.registry().acquire_room(f.doc.id, DocKind::Text).await.unwrap();
        let reader = crate::ws::registry::testing::entry("bob", Permission::Read);
        let reader_id = reader.session_id;
        let membership = f.gateway.registry().join(lease, reader).await.unwrap();
        let session = ActiveSession {
            registry: f.gateway.registry().clone(),
            room: membership.room,
            session_id: reader_id,
            principal: Principal {
                id: "bob".to_string(),
                display_name: "bob".to_string(),
                email: None,
                roles: Vec::new(),
            },
            permission: Permission::Read,
            init: match alice.init_message() {
                SendMessage::Init(init) => init,
                _ => unreachable!(),
            },
            events: None,
            closed: AtomicBool::new(false),
        };

        let err = session.submit_operation(ClientReplica::new().insert_text(0, "x")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Forbidden));
        assert_eq!(err.to_message().code, "forbidden");
        assert_eq!(session.state(), SessionState::Active);
    }

    // Leaving twice is a no-op and dropping an open session still leaves.
    #[tokio::test]
    async fn close_is_idempotent_and_drop_leaves() {
        let f = fixture(DocKind::Canvas).await;
        let alice = f.gateway.open(handshake(Some(token("alice", "Alice")), f.doc.id)).await.unwrap();
        let bob = f.gateway.open(handshake(Some(token("bob", "Bob")), f.doc.id)).await.unwrap();
        let room = f.gateway.registry().room(f.doc.id).await.unwrap();
        assert_eq!(room.session_count().await, 2);

        assert!(alice.close().await);
        assert!(!alice.close().await);
        assert_eq!(room.session_count().await, 1);
        assert_eq!(alice.state(), SessionState::Closed);

        drop(bob);
        wait_until_gone(f.gateway.registry(), f.doc.id).await;
        assert_eq!(f.store.snapshot_saves(), 0);
    }

    #[tokio::test]
    async fn presence_is_broadcast_on_change_only() {
        let f = fixture(DocKind::Text).await;
        let mut alice = f.gateway.open(handshake(Some(token("alice", "Alice")), f.doc.id)).await.unwrap();
        let bob = f.gateway.open(handshake(Some(token("bob", "Bob")), f.doc.id)).await.unwrap();
        let mut events = alice.take_events().unwrap();
        assert!(matches!(events.next().await, Some(SendMessage::Presence(p)) if p.user_id == "bob"));

        let cursor = Some(Cursor::Text { anchor: 2, head: 2 });
        assert!(bob.update_presence(cursor.clone()).await);
        assert!(bob.update_presence(cursor.clone()).await);
        bob.close().await;

        match events.next().await {
            Some(SendMessage::Presence(p)) => assert_eq!(p.cursor, cursor),
            other => panic!("unexpected {:?}", other),
        }
        // No duplicate presence before the leave notice
        assert!(matches!(events.next().await, Some(SendMessage::PresenceLeft(m)) if m.session_id == bob.session_id()));
    }

    #[tokio::test]
    async fn lagging_receiver_gets_snapshot_and_presences() {
        let f = fixture(DocKind::Text).await;
        let mut alice = f.gateway.open(handshake(Some(token("alice", "Alice")), f.doc.id)).await.unwrap();
        let bob = f.gateway.open(handshake(Some(token("bob", "Bob")), f.doc.id)).await.unwrap();
        let mut events = alice.take_events().unwrap();

        // A second tab of bob's comes and goes; its leave notice is among the skipped events
        let tab = f.gateway.open(handshake(Some(token("bob", "Bob")), f.doc.id)).await.unwrap();
        let tab_id = tab.session_id();
        tab.close().await;

        let client = ClientReplica::new();
        let mut text = String::new();
        // Overflow the 64-slot test buffer
        for i in 0..100 {
            let chunk = (i % 10).to_string();
            bob.submit_operation(client.insert_text(text.len(), &chunk)).await.unwrap();
            text.push_str(&chunk);
        }

        match events.next().await {
            Some(SendMessage::Sync(sync)) => {
                let replica = ReplicatedDoc::from_snapshot(DocKind::Text, &sync.snapshot).unwrap();
                assert_eq!(replica.text(), text);
                let peers: Vec<SessionId> = sync.presences.iter().map(|p| p.session_id).collect();
                assert_eq!(peers, vec![bob.session_id()]);
                assert!(!peers.contains(&tab_id));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn join_after_retirement_is_not_found() {
        let f = fixture(DocKind::Text).await;
        // Metadata is still there, as between room eviction and deletion
        f.gateway.registry().retire(f.doc.id).await.unwrap();

        let reason = f.gateway.open(handshake(Some(token("alice", "Alice")), f.doc.id)).await.err();
        assert_eq!(reason, Some(CloseReason::NotFound));
        assert!(f.gateway.registry().room(f.doc.id).await.is_none());
    }

    #[tokio::test]
    async fn joining_phase_is_bounded_as_a_whole() {
        let config = Config {
            join_timeout_ms: 100,
            join_max_attempts: 5,
            ..Config::default()
        };
        let f = fixture_with(DocKind::Text, &config).await;
        f.store.hold_snapshot_loads(true);

        // The registry alone would wait 2s per attempt
        let started = std::time::Instant::now();
        let reason = f.gateway.open(handshake(Some(token("alice", "Alice")), f.doc.id)).await.err();
        assert_eq!(reason, Some(CloseReason::ServiceUnavailable));
        assert!(started.elapsed() < Duration::from_secs(1));

        // The abandoned room still loads and is released
        f.store.hold_snapshot_loads(false);
        wait_until_gone(f.gateway.registry(), f.doc.id).await;
    }
}
