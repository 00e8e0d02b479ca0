use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CommentRow, CommentStore, DocumentRow, DocumentStore, SnapshotRow, StreamStore, UpdateRow, UserRow};
use crate::models::PersistenceError;

#[derive(Default)]
struct StreamState {
    snapshot: Option<SnapshotRow>,
    updates: Vec<UpdateRow>,
    next_seq: i64,
}

/// Process-local store used when no database URL is configured.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<Uuid, DocumentRow>>,
    users: RwLock<HashMap<String, UserRow>>,
    streams: RwLock<HashMap<Uuid, StreamState>>,
    comments: RwLock<HashMap<Uuid, Vec<CommentRow>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_document(&self, doc: &DocumentRow) -> Result<(), PersistenceError> {
        let mut documents = self.documents.write().await;
        if documents.contains_key(&doc.id) {
            return Err(PersistenceError::Unavailable(format!("document '{}' already exists", doc.id)));
        }
        documents.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRow>, PersistenceError> {
        Ok(self.documents.read().await.get(&id).cloned())
    }

    async fn list_documents_for(&self, user_id: &str) -> Result<Vec<DocumentRow>, PersistenceError> {
        let mut docs: Vec<DocumentRow> = self
            .documents
            .read()
            .await
            .values()
            .filter(|d| d.is_member(user_id))
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(docs)
    }

    async fn rename_document(&self, id: Uuid, title: &str) -> Result<Option<DocumentRow>, PersistenceError> {
        let mut documents = self.documents.write().await;
        Ok(documents.get_mut(&id).map(|doc| {
            doc.title = title.to_string();
            doc.updated_at = Utc::now();
            doc.clone()
        }))
    }

    async fn add_collaborator(&self, id: Uuid, user_id: &str) -> Result<Option<DocumentRow>, PersistenceError> {
        let mut documents = self.documents.write().await;
        Ok(documents.get_mut(&id).map(|doc| {
            if doc.collaborator_ids.insert(user_id.to_string()) {
                doc.updated_at = Utc::now();
            }
            doc.clone()
        }))
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool, PersistenceError> {
        Ok(self.documents.write().await.remove(&id).is_some())
    }

    async fn touch_document(&self, id: Uuid) -> Result<(), PersistenceError> {
        if let Some(doc) = self.documents.write().await.get_mut(&id) {
            doc.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn upsert_user(&self, user: &UserRow) -> Result<(), PersistenceError> {
        self.users.write().await.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRow>, PersistenceError> {
        let email = email.trim().to_lowercase();
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email.as_deref().map(str::to_lowercase).as_deref() == Some(email.as_str()))
            .cloned())
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<SnapshotRow>, PersistenceError> {
        Ok(self.streams.read().await.get(&doc_id).and_then(|s| s.snapshot.clone()))
    }

    async fn updates_since(&self, doc_id: Uuid, after_seq: i64) -> Result<Vec<UpdateRow>, PersistenceError> {
        Ok(self
            .streams
            .read()
            .await
            .get(&doc_id)
            .map(|s| s.updates.iter().filter(|u| u.seq > after_seq).cloned().collect())
            .unwrap_or_default())
    }

    async fn append_update(&self, doc_id: Uuid, payload: &[u8]) -> Result<i64, PersistenceError> {
        let mut streams = self.streams.write().await;
        let state = streams.entry(doc_id).or_default();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.updates.push(UpdateRow {
            seq,
            payload: payload.to_vec(),
        });
        Ok(seq)
    }

    async fn save_snapshot(&self, doc_id: Uuid, snapshot: &SnapshotRow) -> Result<bool, PersistenceError> {
        let mut streams = self.streams.write().await;
        let state = streams.entry(doc_id).or_default();
        if let Some(stored) = &state.snapshot {
            if (stored.upto_seq, stored.revision) > (snapshot.upto_seq, snapshot.revision) {
                return Ok(false);
            }
        }
        state.snapshot = Some(snapshot.clone());
        state.updates.retain(|u| u.seq > snapshot.upto_seq);
        state.next_seq = state.next_seq.max(snapshot.upto_seq);
        Ok(true)
    }

    async fn delete_streams(&self, doc_id: Uuid) -> Result<(), PersistenceError> {
        self.streams.write().await.remove(&doc_id);
        Ok(())
    }
}

#[async_trait]
impl CommentStore for MemoryStore {
    async fn insert_comment(&self, comment: &CommentRow) -> Result<(), PersistenceError> {
        self.comments
            .write()
            .await
            .entry(comment.document_id)
            .or_default()
            .push(comment.clone());
        Ok(())
    }

    async fn list_comments(&self, doc_id: Uuid) -> Result<Vec<CommentRow>, PersistenceError> {
        Ok(self.comments.read().await.get(&doc_id).cloned().unwrap_or_default())
    }

    async fn delete_comments(&self, doc_id: Uuid) -> Result<(), PersistenceError> {
        self.comments.write().await.remove(&doc_id);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    /// Consume one unit of a failure budget, if any is left
    fn take(budget: &AtomicUsize) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// [`MemoryStore`] with call counters and injectable stream failures
    pub struct FaultyStore {
        pub inner: MemoryStore,
        snapshot_loads: AtomicUsize,
        snapshot_save_attempts: AtomicUsize,
        snapshot_saves: AtomicUsize,
        failing_loads: AtomicUsize,
        failing_saves: AtomicUsize,
        failing_appends: AtomicUsize,
        /// While true, snapshot saves and loads park before reaching `inner`
        saves_held: watch::Sender<bool>,
        loads_held: watch::Sender<bool>,
    }

    impl FaultyStore {
        pub fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                snapshot_loads: AtomicUsize::new(0),
                snapshot_save_attempts: AtomicUsize::new(0),
                snapshot_saves: AtomicUsize::new(0),
                failing_loads: AtomicUsize::new(0),
                failing_saves: AtomicUsize::new(0),
                failing_appends: AtomicUsize::new(0),
                saves_held: watch::channel(false).0,
                loads_held: watch::channel(false).0,
            }
        }

        pub fn hold_snapshot_saves(&self, held: bool) {
            self.saves_held.send_replace(held);
        }

        pub fn hold_snapshot_loads(&self, held: bool) {
            self.loads_held.send_replace(held);
        }

        pub fn fail_snapshot_loads(&self, n: usize) {
            self.failing_loads.store(n, Ordering::SeqCst);
        }

        pub fn fail_snapshot_saves(&self, n: usize) {
            self.failing_saves.store(n, Ordering::SeqCst);
        }

        pub fn fail_appends(&self, n: usize) {
            self.failing_appends.store(n, Ordering::SeqCst);
        }

        pub fn snapshot_loads(&self) -> usize {
            self.snapshot_loads.load(Ordering::SeqCst)
        }

        pub fn snapshot_save_attempts(&self) -> usize {
            self.snapshot_save_attempts.load(Ordering::SeqCst)
        }

        pub fn snapshot_saves(&self) -> usize {
            self.snapshot_saves.load(Ordering::SeqCst)
        }
    }

    async fn released(held: &watch::Sender<bool>) {
        let mut rx = held.subscribe();
        // The sender lives as long as the store
        let _ = rx.wait_for(|held| !*held).await;
    }

    fn injected() -> PersistenceError {
        PersistenceError::Unavailable("injected failure".to_string())
    }

    #[async_trait]
    impl DocumentStore for FaultyStore {
        async fn insert_document(&self, doc: &DocumentRow) -> Result<(), PersistenceError> {
            self.inner.insert_document(doc).await
        }

        async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRow>, PersistenceError> {
            self.inner.get_document(id).await
        }

        async fn list_documents_for(&self, user_id: &str) -> Result<Vec<DocumentRow>, PersistenceError> {
            self.inner.list_documents_for(user_id).await
        }

        async fn rename_document(&self, id: Uuid, title: &str) -> Result<Option<DocumentRow>, PersistenceError> {
            self.inner.rename_document(id, title).await
        }

        async fn add_collaborator(&self, id: Uuid, user_id: &str) -> Result<Option<DocumentRow>, PersistenceError> {
            self.inner.add_collaborator(id, user_id).await
        }

        async fn delete_document(&self, id: Uuid) -> Result<bool, PersistenceError> {
            self.inner.delete_document(id).await
        }

        async fn touch_document(&self, id: Uuid) -> Result<(), PersistenceError> {
            self.inner.touch_document(id).await
        }

        async fn upsert_user(&self, user: &UserRow) -> Result<(), PersistenceError> {
            self.inner.upsert_user(user).await
        }

        async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRow>, PersistenceError> {
            self.inner.find_user_by_email(email).await
        }
    }

    #[async_trait]
    impl StreamStore for FaultyStore {
        async fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<SnapshotRow>, PersistenceError> {
            self.snapshot_loads.fetch_add(1, Ordering::SeqCst);
            released(&self.loads_held).await;
            if take(&self.failing_loads) {
                return Err(injected());
            }
            self.inner.load_snapshot(doc_id).await
        }

        async fn updates_since(&self, doc_id: Uuid, after_seq: i64) -> Result<Vec<UpdateRow>, PersistenceError> {
            self.inner.updates_since(doc_id, after_seq).await
        }

        async fn append_update(&self, doc_id: Uuid, payload: &[u8]) -> Result<i64, PersistenceError> {
            if take(&self.failing_appends) {
                return Err(injected());
            }
            self.inner.append_update(doc_id, payload).await
        }

        async fn save_snapshot(&self, doc_id: Uuid, snapshot: &SnapshotRow) -> Result<bool, PersistenceError> {
            self.snapshot_save_attempts.fetch_add(1, Ordering::SeqCst);
            released(&self.saves_held).await;
            if take(&self.failing_saves) {
                return Err(injected());
            }
            let applied = self.inner.save_snapshot(doc_id, snapshot).await?;
            if applied {
                self.snapshot_saves.fetch_add(1, Ordering::SeqCst);
            }
            Ok(applied)
        }

        async fn delete_streams(&self, doc_id: Uuid) -> Result<(), PersistenceError> {
            self.inner.delete_streams(doc_id).await
        }
    }

    #[async_trait]
    impl CommentStore for FaultyStore {
        async fn insert_comment(&self, comment: &CommentRow) -> Result<(), PersistenceError> {
            self.inner.insert_comment(comment).await
        }

        async fn list_comments(&self, doc_id: Uuid) -> Result<Vec<CommentRow>, PersistenceError> {
            self.inner.list_comments(doc_id).await
        }

        async fn delete_comments(&self, doc_id: Uuid) -> Result<(), PersistenceError> {
            self.inner.delete_comments(doc_id).await
        }
    }
}
