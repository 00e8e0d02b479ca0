use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// HS256 secret used to verify identity tokens
    pub auth_jwt_secret: Option<String>,

    /// Database URL. Without it everything is kept in memory.
    pub db_url: Option<String>,

    /// Upper bound for verifying a credential during the handshake
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// Upper bound for acquiring and joining a room
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    #[serde(default = "default_join_max_attempts")]
    pub join_max_attempts: u32,

    /// Periodic checkpoint of rooms with connected sessions
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,

    #[serde(default = "default_load_max_retries")]
    pub load_max_retries: u32,

    #[serde(default = "default_backoff_ms")]
    pub load_backoff_ms: u64,

    #[serde(default = "default_flush_max_retries")]
    pub flush_max_retries: u32,

    #[serde(default = "default_backoff_ms")]
    pub flush_backoff_ms: u64,

    /// Messages buffered per session before it is considered lagging
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    #[serde(default = "default_comment_max_len")]
    pub comment_max_len: usize,

    #[serde(default = "default_title_max_len")]
    pub title_max_len: usize,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            cors_origins: None,
            log_level: default_log_level(),
            service_name: default_service_name(),
            auth_jwt_secret: None,
            db_url: None,
            auth_timeout_ms: default_auth_timeout_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            join_max_attempts: default_join_max_attempts(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            load_max_retries: default_load_max_retries(),
            load_backoff_ms: default_backoff_ms(),
            flush_max_retries: default_flush_max_retries(),
            flush_backoff_ms: default_backoff_ms(),
            broadcast_capacity: default_broadcast_capacity(),
            comment_max_len: default_comment_max_len(),
            title_max_len: default_title_max_len(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "colabri-session".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_auth_timeout_ms() -> u64 {
    5_000
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

fn default_join_max_attempts() -> u32 {
    3
}

fn default_checkpoint_interval_ms() -> u64 {
    30_000
}

fn default_load_max_retries() -> u32 {
    3
}

fn default_flush_max_retries() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_comment_max_len() -> usize {
    2_000
}

fn default_title_max_len() -> usize {
    200
}
