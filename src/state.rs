use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::auth::{AccessPolicy, IdentityGate, IdentityProvider, JwtIdentityProvider};
use crate::config::Config;
use crate::db::memory::MemoryStore;
use crate::db::{CommentStore, DocumentStore, StreamStore};
use crate::services::{CommentService, DocumentService};
use crate::ws::{PersistenceBridge, RegistryOptions, RoomRegistry, SessionGateway};

/// Everything the handlers need, built once in `main` and shared through axum state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub identity: Arc<IdentityGate>,
    pub registry: Arc<RoomRegistry>,
    pub gateway: Arc<SessionGateway>,
    pub documents: Arc<DocumentService>,
    pub comments: Arc<CommentService>,
}

impl AppState {
    pub fn new<S>(config: Config, store: Arc<S>, provider: Arc<dyn IdentityProvider>) -> Self
    where
        S: DocumentStore + StreamStore + CommentStore + 'static,
    {
        let documents: Arc<dyn DocumentStore> = store.clone();
        let streams: Arc<dyn StreamStore> = store.clone();
        let comments: Arc<dyn CommentStore> = store;

        let identity = Arc::new(IdentityGate::new(provider));
        let policy = Arc::new(AccessPolicy::new(documents.clone()));
        let persistence = Arc::new(PersistenceBridge::new(streams.clone(), documents.clone()));
        let registry = RoomRegistry::new(persistence.clone(), RegistryOptions::from_config(&config));
        let gateway = Arc::new(SessionGateway::new(
            identity.clone(),
            policy.clone(),
            registry.clone(),
            &config,
        ));
        let document_service = Arc::new(DocumentService::new(
            documents,
            streams,
            comments.clone(),
            policy.clone(),
            registry.clone(),
            persistence,
            config.title_max_len,
        ));
        let comment_service = Arc::new(CommentService::new(comments, policy, config.comment_max_len));

        Self {
            config: Arc::new(config),
            identity,
            registry,
            gateway,
            documents: document_service,
            comments: comment_service,
        }
    }

    /// State backed by the process-local store
    pub fn in_memory(config: Config) -> Self {
        let provider = Arc::new(jwt_provider(&config));
        Self::new(config, Arc::new(MemoryStore::new()), provider)
    }
}

/// JWT verification with the configured secret. Without one, every token is rejected.
pub fn jwt_provider(config: &Config) -> JwtIdentityProvider {
    match config.auth_jwt_secret.as_deref().filter(|s| !s.is_empty()) {
        Some(secret) => JwtIdentityProvider::new(secret),
        None => {
            warn!("No JWT secret configured - all credentials will be rejected");
            JwtIdentityProvider::new(&Uuid::new_v4().to_string())
        }
    }
}
