use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{AccessPolicy, Permission, Principal};
use crate::db::{CommentStore, DocumentRow, DocumentStore, StreamStore, UserRow};
use crate::models::{
    ApiError, AuthzError, CreateDocumentRequest, DocKind, PersistenceError, RenameDocumentRequest, ValidationError,
};
use crate::ws::{PersistenceBridge, RoomRegistry};

pub const DEFAULT_TITLE: &str = "Untitled";

/// Current state of a document's content
pub struct DocumentContent {
    pub kind: DocKind,
    pub json: serde_json::Value,
    pub snapshot: Vec<u8>,
    /// Taken from a resident room rather than storage
    pub live: bool,
}

/// Document metadata operations. Everything that changes metadata is owner-gated.
pub struct DocumentService {
    documents: Arc<dyn DocumentStore>,
    streams: Arc<dyn StreamStore>,
    comments: Arc<dyn CommentStore>,
    policy: Arc<AccessPolicy>,
    registry: Arc<RoomRegistry>,
    persistence: Arc<PersistenceBridge>,
    /// Principals recently written to the user directory
    known_users: Cache<String, UserRow>,
    title_max_len: usize,
}

impl DocumentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        streams: Arc<dyn StreamStore>,
        comments: Arc<dyn CommentStore>,
        policy: Arc<AccessPolicy>,
        registry: Arc<RoomRegistry>,
        persistence: Arc<PersistenceBridge>,
        title_max_len: usize,
    ) -> Self {
        let known_users = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(10 * 60))
            .build();
        Self {
            documents,
            streams,
            comments,
            policy,
            registry,
            persistence,
            known_users,
            title_max_len,
        }
    }

    pub fn known_user_count(&self) -> u64 {
        // entry_count lags until pending writes are applied
        self.known_users.run_pending_tasks();
        self.known_users.entry_count()
    }

    /// Record the principal in the user directory so collaborators can be
    /// added by e-mail.
    pub async fn remember_user(&self, principal: &Principal) -> Result<(), PersistenceError> {
        let user = UserRow {
            id: principal.id.clone(),
            name: principal.display_name.clone(),
            email: principal.email.as_deref().map(|e| e.trim().to_lowercase()),
        };
        if self.known_users.get(&user.id).as_ref() == Some(&user) {
            return Ok(());
        }
        self.documents.upsert_user(&user).await?;
        self.known_users.insert(user.id.clone(), user);
        Ok(())
    }

    pub async fn create(&self, principal: &Principal, req: CreateDocumentRequest) -> Result<DocumentRow, ApiError> {
        let title = match req.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(title) => self.check_title(title)?,
            None => DEFAULT_TITLE.to_string(),
        };
        let kind = match req.kind.as_deref() {
            None => DocKind::Text,
            Some(kind) => DocKind::parse(kind)
                .ok_or_else(|| ValidationError::new("type", format!("Unknown document type '{}'", kind)))?,
        };

        let doc = DocumentRow::new(&principal.id, &title, kind);
        self.documents.insert_document(&doc).await?;
        info!("Document {} ({}) created by {}", doc.id, kind.as_str(), principal.id);
        Ok(doc)
    }

    /// Documents the caller collaborates on, most recently updated first
    pub async fn list(&self, principal: &Principal) -> Result<Vec<DocumentRow>, ApiError> {
        Ok(self.documents.list_documents_for(&principal.id).await?)
    }

    pub async fn get(&self, principal: &Principal, id: Uuid) -> Result<DocumentRow, ApiError> {
        Ok(self.policy.authorize(principal, id, Permission::Read).await?.document)
    }

    pub async fn rename(
        &self,
        principal: &Principal,
        id: Uuid,
        req: RenameDocumentRequest,
    ) -> Result<DocumentRow, ApiError> {
        self.policy.authorize(principal, id, Permission::Owner).await?;
        let title = req
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ValidationError::new("title", "Title is required"))?;
        let title = self.check_title(title)?;

        let doc = self
            .documents
            .rename_document(id, &title)
            .await?
            .ok_or(AuthzError::NotFound)?;
        info!("Document {} renamed by {}", id, principal.id);
        Ok(doc)
    }

    /// Share the document with the user registered under `email`. Adding an
    /// existing collaborator again succeeds without changes.
    pub async fn add_collaborator(&self, principal: &Principal, id: Uuid, email: &str) -> Result<DocumentRow, ApiError> {
        self.policy.authorize(principal, id, Permission::Owner).await?;
        let email = email.trim();
        if email.is_empty() {
            return Err(ValidationError::new("email", "Email is required").into());
        }
        let user = self
            .documents
            .find_user_by_email(email)
            .await?
            .ok_or_else(|| ValidationError::new("email", "No user with this email"))?;

        let doc = self
            .documents
            .add_collaborator(id, &user.id)
            .await?
            .ok_or(AuthzError::NotFound)?;
        info!("User {} added to document {} by {}", user.id, id, principal.id);
        Ok(doc)
    }

    /// Delete metadata, replicated state and comments. Refused while sessions are connected.
    pub async fn delete(&self, principal: &Principal, id: Uuid) -> Result<(), ApiError> {
        self.policy.authorize(principal, id, Permission::Owner).await?;
        // From here on a handshake that already passed authorization cannot open a room
        self.registry.retire(id).await?;

        let deleted = match self.documents.delete_document(id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                self.registry.reinstate(id);
                return Err(e.into());
            }
        };
        if !deleted {
            self.registry.reinstate(id);
            return Err(AuthzError::NotFound.into());
        }
        // Metadata is gone, leftovers are unreachable
        if let Err(e) = self.streams.delete_streams(id).await {
            warn!("Failed to delete streams of document {}: {}", id, e);
        }
        if let Err(e) = self.comments.delete_comments(id).await {
            warn!("Failed to delete comments of document {}: {}", id, e);
        }
        info!("Document {} deleted by {}", id, principal.id);
        Ok(())
    }

    /// Live room state when resident, stored state otherwise
    pub async fn content(&self, principal: &Principal, id: Uuid) -> Result<DocumentContent, ApiError> {
        let grant = self.policy.authorize(principal, id, Permission::Read).await?;
        let kind = grant.document.kind;

        if let Some(room) = self.registry.room(id).await {
            let live = room
                .with_doc(|doc| doc.export_snapshot().map(|snapshot| (doc.to_json(), snapshot)))
                .await;
            // A closed room has already dropped its document
            if let Some(result) = live {
                let (json, snapshot) = result?;
                return Ok(DocumentContent {
                    kind,
                    json,
                    snapshot,
                    live: true,
                });
            }
        }

        let loaded = self.persistence.load(id, kind).await?;
        Ok(DocumentContent {
            kind,
            json: loaded.doc.to_json(),
            snapshot: loaded.doc.export_snapshot()?,
            live: false,
        })
    }

    fn check_title(&self, title: &str) -> Result<String, ValidationError> {
        if title.chars().count() > self.title_max_len {
            return Err(ValidationError::new(
                "title",
                format!("Title exceeds {} characters", self.title_max_len),
            ));
        }
        Ok(title.to_string())
    }
}
