use std::panic;
use std::sync::Arc;

use colabri_session::config::Config;
use colabri_session::db::dbcolab::DbColab;
use colabri_session::db::memory::MemoryStore;
use colabri_session::state::jwt_provider;
use colabri_session::{build_app, AppState};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "colabri_session=debug,tower_http=debug,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });
    info!("{} running in {} mode", config.service_name, config.environment);

    let checkpoint_interval = config.checkpoint_interval();
    let address = config.server_address();
    let provider = Arc::new(jwt_provider(&config));

    // Storage: PostgreSQL when configured, process memory otherwise
    let state = match config.db_url.clone() {
        Some(db_url) => match open_database(&db_url).await {
            Ok(db) => {
                info!("Database initialized successfully");
                AppState::new(config, Arc::new(db), provider)
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Falling back to in-memory storage - documents will not survive a restart");
                AppState::new(config, Arc::new(MemoryStore::new()), provider)
            }
        },
        None => {
            warn!("No database URL configured - documents will not survive a restart");
            AppState::new(config, Arc::new(MemoryStore::new()), provider)
        }
    };

    let checkpointer = state.registry.spawn_checkpointer(checkpoint_interval);
    let registry = state.registry.clone();
    let app = build_app(state);

    // Start the HTTP/API server
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", address, e);
            return;
        }
    };

    info!("🚀 Server running on http://{}", address);
    info!("📡 WebSocket available at ws://{}/ws", address);
    info!("📚 Swagger UI available at http://{}/swagger", address);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    // Persist whatever the periodic checkpoint and pending drains have not covered yet
    checkpointer.abort();
    let flushed = registry.shutdown().await;
    info!("Shutdown complete, {} room(s) flushed", flushed);
}

async fn open_database(db_url: &str) -> Result<DbColab, sqlx::Error> {
    let db = DbColab::new(db_url).await?;
    db.migrate().await?;
    Ok(db)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
