//! Storage seams for document metadata, replicated-document streams and
//! comments. [`memory::MemoryStore`] backs tests and database-less runs,
//! [`dbcolab::DbColab`] is the PostgreSQL implementation.

pub mod dbcolab;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::models::{DocKind, PersistenceError};

/// Document metadata row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRow {
    pub id: Uuid,
    pub owner_id: String,
    pub title: String,
    pub kind: DocKind,
    /// Always contains the owner
    pub collaborator_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRow {
    pub fn new(owner_id: &str, title: &str, kind: DocKind) -> Self {
        let now = Utc::now();
        let mut collaborator_ids = BTreeSet::new();
        collaborator_ids.insert(owner_id.to_string());
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            kind,
            collaborator_ids,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.is_owner(user_id) || self.collaborator_ids.contains(user_id)
    }
}

/// A principal the service has seen, used to resolve collaborator e-mails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRow {
    pub id: Uuid,
    pub document_id: Uuid,
    pub author_id: String,
    pub author_name: String,
    pub text: String,
    pub range_start: u32,
    pub range_end: u32,
    pub created_at: DateTime<Utc>,
}

/// Latest durable checkpoint of a replicated document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub content: Vec<u8>,
    /// Highest operation-log sequence number folded into `content`
    pub upto_seq: i64,
    /// Room revision at capture; orders snapshots that cover the same log prefix
    pub revision: i64,
}

/// One accepted operation in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRow {
    pub seq: i64,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, doc: &DocumentRow) -> Result<(), PersistenceError>;

    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRow>, PersistenceError>;

    /// Documents the user collaborates on, most recently updated first
    async fn list_documents_for(&self, user_id: &str) -> Result<Vec<DocumentRow>, PersistenceError>;

    async fn rename_document(&self, id: Uuid, title: &str) -> Result<Option<DocumentRow>, PersistenceError>;

    /// Idempotent
    async fn add_collaborator(&self, id: Uuid, user_id: &str) -> Result<Option<DocumentRow>, PersistenceError>;

    async fn delete_document(&self, id: Uuid) -> Result<bool, PersistenceError>;

    /// Bump `updated_at` after the content changed
    async fn touch_document(&self, id: Uuid) -> Result<(), PersistenceError>;

    async fn upsert_user(&self, user: &UserRow) -> Result<(), PersistenceError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRow>, PersistenceError>;
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<SnapshotRow>, PersistenceError>;

    /// Log entries with `seq > after_seq`, ascending
    async fn updates_since(&self, doc_id: Uuid, after_seq: i64) -> Result<Vec<UpdateRow>, PersistenceError>;

    /// Returns the sequence number assigned to the entry
    async fn append_update(&self, doc_id: Uuid, payload: &[u8]) -> Result<i64, PersistenceError>;

    /// Replaces the snapshot and drops log entries with `seq <= upto_seq`.
    /// A snapshot older than the stored one, by `(upto_seq, revision)`, is
    /// ignored and `false` is returned.
    async fn save_snapshot(&self, doc_id: Uuid, snapshot: &SnapshotRow) -> Result<bool, PersistenceError>;

    async fn delete_streams(&self, doc_id: Uuid) -> Result<(), PersistenceError>;
}

#[async_trait]
pub trait CommentStore: Send + Sync {
    async fn insert_comment(&self, comment: &CommentRow) -> Result<(), PersistenceError>;

    /// Creation order
    async fn list_comments(&self, doc_id: Uuid) -> Result<Vec<CommentRow>, PersistenceError>;

    async fn delete_comments(&self, doc_id: Uuid) -> Result<(), PersistenceError>;
}
