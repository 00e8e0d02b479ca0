use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use uuid::Uuid;

use super::presence::Presence;
use crate::auth::{Permission, Principal};
use crate::models::lorodoc::ReplicatedDoc;
use crate::models::{DocKind, PersistenceError};

pub type SessionId = Uuid;

/// Lifecycle of a room's replicated document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Draining,
    Closed,
    Failed,
}

/// What a room fans out to its sessions
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Operation { origin: SessionId, payload: Arc<Vec<u8>> },
    Presence(Presence),
    PresenceLeft { session_id: SessionId },
    /// The room is gone; subscribers should disconnect
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub session_id: SessionId,
    pub principal: Principal,
    pub permission: Permission,
    pub presence: Presence,
}

impl SessionEntry {
    pub fn new(principal: Principal, permission: Permission) -> Self {
        let session_id = Uuid::new_v4();
        let presence = Presence::new(session_id, &principal.id, &principal.display_name);
        Self {
            session_id,
            principal,
            permission,
            presence,
        }
    }
}

/// State captured under the room lock and written outside of it
pub struct Checkpoint {
    pub package: Vec<u8>,
    /// Log entries at or below this sequence number are covered
    pub upto_seq: i64,
    pub revision: u64,
}

pub(crate) struct RoomState {
    pub load_state: LoadState,
    pub doc: Option<ReplicatedDoc>,
    pub sessions: HashMap<SessionId, SessionEntry>,
    /// Outstanding leases that have not joined yet
    pub interest: usize,
    /// Bumped whenever a drain starts or is aborted
    pub drain_epoch: u64,
    pub last_seq: i64,
    pub revision: u64,
    pub flushed_revision: u64,
    /// An append failed; operations since are only covered by the next checkpoint
    pub log_gap: bool,
    pub last_activity_at: DateTime<Utc>,
}

impl RoomState {
    fn new() -> Self {
        Self {
            load_state: LoadState::Unloaded,
            doc: None,
            sessions: HashMap::new(),
            interest: 0,
            drain_epoch: 0,
            last_seq: 0,
            revision: 0,
            flushed_revision: 0,
            log_gap: false,
            last_activity_at: Utc::now(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.revision > self.flushed_revision || self.log_gap
    }

    /// Nobody is connected or about to connect
    pub fn is_idle(&self) -> bool {
        self.sessions.is_empty() && self.interest == 0
    }

    pub fn presences(&self) -> Vec<Presence> {
        let mut presences: Vec<Presence> = self.sessions.values().map(|s| s.presence.clone()).collect();
        presences.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.session_id.cmp(&b.session_id)));
        presences
    }

    pub fn checkpoint(&self) -> Result<Option<Checkpoint>, PersistenceError> {
        let Some(doc) = self.doc.as_ref() else {
            return Ok(None);
        };
        Ok(Some(Checkpoint {
            package: doc.to_package()?,
            upto_seq: self.last_seq,
            revision: self.revision,
        }))
    }

    /// Record a successful flush of `checkpoint`
    pub fn mark_flushed(&mut self, checkpoint: &Checkpoint) {
        self.flushed_revision = self.flushed_revision.max(checkpoint.revision);
        // Operations applied after the capture were not logged either
        if self.revision == checkpoint.revision {
            self.log_gap = false;
        }
    }
}

/// One resident document and its connected sessions.
pub struct Room {
    pub doc_id: Uuid,
    pub kind: DocKind,
    pub(crate) state: Mutex<RoomState>,
    /// Held from checkpoint capture until the write settles. Taken before `state`.
    pub(crate) flush_lock: Mutex<()>,
    ready: watch::Sender<LoadState>,
    pub(crate) events: broadcast::Sender<RoomEvent>,
}

impl Room {
    pub(crate) fn new(doc_id: Uuid, kind: DocKind, capacity: usize) -> Self {
        let (ready, _) = watch::channel(LoadState::Unloaded);
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            doc_id,
            kind,
            state: Mutex::new(RoomState::new()),
            flush_lock: Mutex::new(()),
            ready,
            events,
        }
    }

    /// Must be called with the room lock held
    pub(crate) fn set_load_state(&self, state: &mut RoomState, next: LoadState) {
        state.load_state = next;
        self.ready.send_replace(next);
    }

    pub fn watch_load_state(&self) -> watch::Receiver<LoadState> {
        self.ready.subscribe()
    }

    pub async fn load_state(&self) -> LoadState {
        self.state.lock().await.load_state
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn presences(&self) -> Vec<Presence> {
        self.state.lock().await.presences()
    }

    /// Document snapshot and presences of every session, taken under one lock
    pub async fn resync_state(&self) -> Option<Result<(Vec<u8>, Vec<Presence>), PersistenceError>> {
        let state = self.state.lock().await;
        let doc = state.doc.as_ref()?;
        Some(doc.export_snapshot().map(|snapshot| (snapshot, state.presences())))
    }

    /// Run `f` against the resident document, if loaded
    pub async fn with_doc<T>(&self, f: impl FnOnce(&ReplicatedDoc) -> T) -> Option<T> {
        let state = self.state.lock().await;
        state.doc.as_ref().map(f)
    }

    pub(crate) fn broadcast(&self, event: RoomEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}
