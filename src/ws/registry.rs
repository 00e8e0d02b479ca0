use chrono::Utc;
use moka::sync::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::persistence::{PersistenceBridge, RetryPolicy};
use super::presence::{Cursor, Presence};
use super::room::{LoadState, Room, RoomEvent, RoomState, SessionEntry, SessionId};
use crate::config::Config;
use crate::models::{ConflictError, DocKind, RegistryStats, ValidationError};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RoomError {
    #[error("room is closing")]
    Closing,
    #[error("document could not be loaded")]
    Unavailable,
    #[error("timed out waiting for the room")]
    Timeout,
    #[error("document is being deleted")]
    NotFound,
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("session is not part of the room")]
    NotJoined,
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub broadcast_capacity: usize,
    pub join_timeout: Duration,
    pub load_retry: RetryPolicy,
    pub flush_retry: RetryPolicy,
}

impl RegistryOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            broadcast_capacity: config.broadcast_capacity,
            join_timeout: config.join_timeout(),
            load_retry: RetryPolicy::new(config.load_max_retries, Duration::from_millis(config.load_backoff_ms)),
            flush_retry: RetryPolicy::new(config.flush_max_retries, Duration::from_millis(config.flush_backoff_ms)),
        }
    }
}

/// Interest in a room that is not yet a session. Dropping an unconsumed
/// lease releases the interest, which may start a drain.
pub struct RoomLease {
    registry: Arc<RoomRegistry>,
    room: Arc<Room>,
    consumed: bool,
}

impl RoomLease {
    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }
}

impl Drop for RoomLease {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        let registry = self.registry.clone();
        let room = self.room.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { registry.release_interest(room).await });
        }
    }
}

/// What a session gets when it joins
pub struct Membership {
    pub room: Arc<Room>,
    pub events: broadcast::Receiver<RoomEvent>,
    /// Document snapshot taken atomically with the subscription
    pub snapshot: Vec<u8>,
    /// Presences of the other sessions
    pub presences: Vec<Presence>,
}

/// Owns every resident room, at most one per document id.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    /// Documents being deleted; no room may be created for them.
    /// Written under the `rooms` write lock.
    retired: Cache<Uuid, ()>,
    persistence: Arc<PersistenceBridge>,
    options: RegistryOptions,
}

impl RoomRegistry {
    pub fn new(persistence: Arc<PersistenceBridge>, options: RegistryOptions) -> Arc<Self> {
        let retired = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(Duration::from_secs(10 * 60))
            .build();
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            retired,
            persistence,
            options,
        })
    }

    pub async fn room(&self, doc_id: Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(&doc_id).cloned()
    }

    /// Register interest in the document's room and wait until it is loaded.
    pub async fn acquire_room(self: &Arc<Self>, doc_id: Uuid, kind: DocKind) -> Result<RoomLease, RoomError> {
        tokio::time::timeout(self.options.join_timeout, self.acquire_inner(doc_id, kind))
            .await
            .map_err(|_| RoomError::Timeout)?
    }

    async fn acquire_inner(self: &Arc<Self>, doc_id: Uuid, kind: DocKind) -> Result<RoomLease, RoomError> {
        let lease = loop {
            let room = self.room_or_create(doc_id, kind).await?;

            let mut state = room.state.lock().await;
            match state.load_state {
                LoadState::Closed | LoadState::Failed => {
                    // Stale entry on its way out
                    drop(state);
                    self.forget(&room).await;
                    continue;
                }
                LoadState::Draining => {
                    self.abort_drain(&room, &mut state);
                }
                _ => {}
            }
            state.interest += 1;
            drop(state);

            break RoomLease {
                registry: self.clone(),
                room,
                consumed: false,
            };
        };

        let mut load = lease.room.watch_load_state();
        loop {
            let current = *load.borrow_and_update();
            match current {
                LoadState::Ready => return Ok(lease),
                LoadState::Failed => return Err(RoomError::Unavailable),
                LoadState::Closed => return Err(RoomError::Closing),
                _ => {}
            }
            if load.changed().await.is_err() {
                return Err(RoomError::Closing);
            }
        }
    }

    async fn room_or_create(self: &Arc<Self>, doc_id: Uuid, kind: DocKind) -> Result<Arc<Room>, RoomError> {
        if self.retired.contains_key(&doc_id) {
            return Err(RoomError::NotFound);
        }
        if let Some(room) = self.rooms.read().await.get(&doc_id) {
            return Ok(room.clone());
        }

        let mut rooms = self.rooms.write().await;
        if self.retired.contains_key(&doc_id) {
            return Err(RoomError::NotFound);
        }
        if let Some(room) = rooms.get(&doc_id) {
            return Ok(room.clone());
        }
        let room = Arc::new(Room::new(doc_id, kind, self.options.broadcast_capacity));
        rooms.insert(doc_id, room.clone());
        drop(rooms);

        info!("Room created for document {}", doc_id);
        tokio::spawn(self.clone().run_load(room.clone()));
        Ok(room)
    }

    /// Remove `room` from the map if it is still the entry for its document
    async fn forget(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(&room.doc_id).is_some_and(|r| Arc::ptr_eq(r, room)) {
            rooms.remove(&room.doc_id);
        }
    }

    async fn run_load(self: Arc<Self>, room: Arc<Room>) {
        {
            let mut state = room.state.lock().await;
            if state.load_state != LoadState::Unloaded {
                return;
            }
            room.set_load_state(&mut state, LoadState::Loading);
        }

        let loaded = self
            .persistence
            .load_with_retry(room.doc_id, room.kind, &self.options.load_retry)
            .await;

        let mut state = room.state.lock().await;
        if state.load_state != LoadState::Loading {
            // Evicted while loading
            return;
        }
        match loaded {
            Ok(loaded) => {
                state.doc = Some(loaded.doc);
                state.last_seq = loaded.last_seq;
                state.revision = loaded.revision;
                state.flushed_revision = loaded.revision;
                state.last_activity_at = Utc::now();
                room.set_load_state(&mut state, LoadState::Ready);
                info!("Room for document {} is ready", room.doc_id);
                // Every joiner may have given up meanwhile
                self.begin_drain_if_idle(&room, &mut state);
            }
            Err(e) => {
                error!("Giving up loading document {}: {}", room.doc_id, e);
                room.set_load_state(&mut state, LoadState::Failed);
                drop(state);
                self.forget(&room).await;
            }
        }
    }

    async fn release_interest(self: Arc<Self>, room: Arc<Room>) {
        let mut state = room.state.lock().await;
        state.interest = state.interest.saturating_sub(1);
        self.begin_drain_if_idle(&room, &mut state);
    }

    /// Turn a lease into a session.
    pub async fn join(self: &Arc<Self>, mut lease: RoomLease, entry: SessionEntry) -> Result<Membership, RoomError> {
        let room = lease.room.clone();
        let mut state = room.state.lock().await;
        lease.consumed = true;
        state.interest = state.interest.saturating_sub(1);

        match state.load_state {
            LoadState::Ready => {}
            LoadState::Draining => self.abort_drain(&room, &mut state),
            _ => return Err(RoomError::Closing),
        }

        let snapshot = match state.doc.as_ref().map(|doc| doc.export_snapshot()) {
            Some(Ok(snapshot)) => snapshot,
            Some(Err(e)) => {
                error!("Failed to snapshot document {} for join: {}", room.doc_id, e);
                self.begin_drain_if_idle(&room, &mut state);
                return Err(RoomError::Unavailable);
            }
            None => return Err(RoomError::Closing),
        };

        let events = room.events.subscribe();
        let presences = state.presences();
        let presence = entry.presence.clone();
        debug!("Session {} ({}) joined document {}", entry.session_id, entry.principal.id, room.doc_id);
        state.sessions.insert(entry.session_id, entry);
        state.last_activity_at = Utc::now();
        room.broadcast(RoomEvent::Presence(presence));
        drop(state);

        Ok(Membership {
            room,
            events,
            snapshot,
            presences,
        })
    }

    /// Returns false if the session had already left.
    pub async fn leave(self: &Arc<Self>, room: &Arc<Room>, session_id: SessionId) -> bool {
        let mut state = room.state.lock().await;
        if state.sessions.remove(&session_id).is_none() {
            return false;
        }
        room.broadcast(RoomEvent::PresenceLeft { session_id });
        state.last_activity_at = Utc::now();
        debug!(
            "Session {} left document {} ({} remaining)",
            session_id,
            room.doc_id,
            state.sessions.len()
        );
        self.begin_drain_if_idle(room, &mut state);
        true
    }

    /// Merge, log and fan out one operation. Returns the room revision.
    pub async fn apply_operation(&self, room: &Room, origin: SessionId, payload: Vec<u8>) -> Result<u64, OperationError> {
        let mut state = room.state.lock().await;
        if !state.sessions.contains_key(&origin) {
            return Err(OperationError::NotJoined);
        }
        state.doc.as_ref().ok_or(OperationError::NotJoined)?.apply(&payload)?;

        if !state.log_gap {
            match self.persistence.append(room.doc_id, &payload).await {
                Ok(seq) => state.last_seq = state.last_seq.max(seq),
                Err(e) => {
                    warn!("Append to log of document {} failed, waiting for a checkpoint: {}", room.doc_id, e);
                    state.log_gap = true;
                }
            }
        }

        state.revision += 1;
        state.last_activity_at = Utc::now();
        room.broadcast(RoomEvent::Operation {
            origin,
            payload: Arc::new(payload),
        });
        Ok(state.revision)
    }

    /// Store the session's cursor and broadcast it if it changed.
    pub async fn update_presence(&self, room: &Room, session_id: SessionId, cursor: Option<Cursor>) -> bool {
        let mut state = room.state.lock().await;
        let Some(session) = state.sessions.get_mut(&session_id) else {
            return false;
        };
        if session.presence.cursor != cursor {
            session.presence.cursor = cursor;
            let presence = session.presence.clone();
            room.broadcast(RoomEvent::Presence(presence));
        }
        true
    }

    /// Close a resident room without flushing. Refused while sessions are
    /// connected or joining. Waits for a flush in flight to settle first.
    pub async fn evict(&self, doc_id: Uuid) -> Result<bool, ConflictError> {
        let Some(room) = self.room(doc_id).await else {
            return Ok(false);
        };
        let _flushing = room.flush_lock.lock().await;
        let mut state = room.state.lock().await;
        if !state.is_idle() {
            return Err(ConflictError::DocumentInUse(state.sessions.len() + state.interest));
        }
        if state.load_state == LoadState::Closed {
            return Ok(false);
        }
        state.drain_epoch += 1;
        self.close_room(&room, &mut state).await;
        Ok(true)
    }

    /// Stop admitting sessions to the document and evict its room. The
    /// document stays retired until [`RoomRegistry::reinstate`].
    pub async fn retire(&self, doc_id: Uuid) -> Result<bool, ConflictError> {
        {
            let _rooms = self.rooms.write().await;
            self.retired.insert(doc_id, ());
        }
        match self.evict(doc_id).await {
            Ok(evicted) => {
                info!("Document {} retired", doc_id);
                Ok(evicted)
            }
            Err(e) => {
                self.reinstate(doc_id);
                Err(e)
            }
        }
    }

    pub fn reinstate(&self, doc_id: Uuid) {
        self.retired.invalidate(&doc_id);
    }

    fn abort_drain(&self, room: &Room, state: &mut RoomState) {
        state.drain_epoch += 1;
        room.set_load_state(state, LoadState::Ready);
        info!("Drain of document {} aborted by a late join", room.doc_id);
    }

    fn begin_drain_if_idle(self: &Arc<Self>, room: &Arc<Room>, state: &mut RoomState) {
        if state.load_state != LoadState::Ready || !state.is_idle() {
            return;
        }
        state.drain_epoch += 1;
        room.set_load_state(state, LoadState::Draining);
        debug!("Draining room for document {}", room.doc_id);
        tokio::spawn(self.clone().run_drain(room.clone(), state.drain_epoch));
    }

    async fn run_drain(self: Arc<Self>, room: Arc<Room>, epoch: u64) {
        let policy = self.options.flush_retry;
        let mut attempt = 1;
        loop {
            let flushing = room.flush_lock.lock().await;
            let checkpoint = {
                let mut state = room.state.lock().await;
                if state.drain_epoch != epoch || state.load_state != LoadState::Draining {
                    return;
                }
                if !state.is_dirty() {
                    self.close_room(&room, &mut state).await;
                    return;
                }
                match state.checkpoint() {
                    Ok(Some(checkpoint)) => checkpoint,
                    Ok(None) => {
                        self.close_room(&room, &mut state).await;
                        return;
                    }
                    Err(e) => {
                        error!("Cannot checkpoint document {}, keeping it resident: {}", room.doc_id, e);
                        room.set_load_state(&mut state, LoadState::Ready);
                        return;
                    }
                }
            };

            let flushed = self.persistence.flush(room.doc_id, &checkpoint).await;
            if flushed.is_ok() {
                room.state.lock().await.mark_flushed(&checkpoint);
            }
            drop(flushing);

            match flushed {
                Ok(()) => {}
                Err(e) if attempt < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    warn!("Flush of document {} failed (attempt {}), retrying in {:?}: {}", room.doc_id, attempt, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Giving up flushing document {} after {} attempt(s): {}", room.doc_id, attempt, e);
                    let mut state = room.state.lock().await;
                    if state.drain_epoch == epoch && state.load_state == LoadState::Draining {
                        room.set_load_state(&mut state, LoadState::Ready);
                    }
                    return;
                }
            }
        }
    }

    /// Must be called with the room lock held
    async fn close_room(&self, room: &Arc<Room>, state: &mut RoomState) {
        state.doc = None;
        room.set_load_state(state, LoadState::Closed);
        room.broadcast(RoomEvent::Closed);
        self.forget(room).await;
        info!("Room for document {} closed", room.doc_id);
    }

    /// Checkpoint every dirty room that still has sessions, and drain idle
    /// rooms a failed flush left behind. Returns the number of rooms flushed.
    pub async fn checkpoint_all(self: &Arc<Self>) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut flushed = 0;

        for room in rooms {
            let _flushing = room.flush_lock.lock().await;
            let checkpoint = {
                let mut state = room.state.lock().await;
                if state.load_state != LoadState::Ready {
                    continue;
                }
                if state.is_idle() {
                    self.begin_drain_if_idle(&room, &mut state);
                    continue;
                }
                if !state.is_dirty() {
                    continue;
                }
                match state.checkpoint() {
                    Ok(Some(checkpoint)) => checkpoint,
                    Ok(None) => continue,
                    Err(e) => {
                        error!("Cannot checkpoint document {}: {}", room.doc_id, e);
                        continue;
                    }
                }
            };

            match self.persistence.flush(room.doc_id, &checkpoint).await {
                Ok(()) => {
                    room.state.lock().await.mark_flushed(&checkpoint);
                    flushed += 1;
                }
                Err(e) => warn!("Checkpoint of document {} failed: {}", room.doc_id, e),
            }
        }

        if flushed > 0 {
            debug!("Checkpointed {} room(s)", flushed);
        }
        flushed
    }

    /// Flush every room holding unsaved state, connected or draining, then
    /// close it. Meant for after the listener stopped. Returns the number of
    /// rooms flushed.
    pub async fn shutdown(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut flushed = 0;

        for room in rooms {
            let _flushing = room.flush_lock.lock().await;
            let checkpoint = {
                let mut state = room.state.lock().await;
                if state.load_state == LoadState::Closed {
                    continue;
                }
                // Any drain still scheduled stops at its next step
                state.drain_epoch += 1;
                if !state.is_dirty() {
                    self.close_room(&room, &mut state).await;
                    continue;
                }
                match state.checkpoint() {
                    Ok(Some(checkpoint)) => checkpoint,
                    Ok(None) => {
                        self.close_room(&room, &mut state).await;
                        continue;
                    }
                    Err(e) => {
                        error!("Cannot checkpoint document {} at shutdown: {}", room.doc_id, e);
                        self.close_room(&room, &mut state).await;
                        continue;
                    }
                }
            };

            let policy = self.options.flush_retry;
            let mut attempt = 1;
            let saved = loop {
                match self.persistence.flush(room.doc_id, &checkpoint).await {
                    Ok(()) => break true,
                    Err(e) if attempt < policy.max_attempts => {
                        warn!("Shutdown flush of document {} failed (attempt {}): {}", room.doc_id, attempt, e);
                        tokio::time::sleep(policy.delay(attempt)).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        error!("Unsaved changes of document {} lost at shutdown: {}", room.doc_id, e);
                        break false;
                    }
                }
            };

            let mut state = room.state.lock().await;
            if saved {
                state.mark_flushed(&checkpoint);
                flushed += 1;
            }
            self.close_room(&room, &mut state).await;
        }
        flushed
    }

    pub fn spawn_checkpointer(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.checkpoint_all().await;
            }
        })
    }

    pub async fn stats(&self) -> RegistryStats {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut stats = RegistryStats::default();
        for room in rooms {
            let state = room.state.lock().await;
            stats.n_rooms += 1;
            stats.n_sessions += state.sessions.len() as u32;
            if state.is_dirty() {
                stats.n_dirty_rooms += 1;
            }
            let key = serde_json::to_value(state.load_state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *stats.rooms_by_state.entry(key).or_default() += 1;
        }
        stats
    }
}
