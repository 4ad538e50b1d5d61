//! Configuration management for the sync agent.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where queued operations live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// Durable sqlite database
    Sqlite,
    /// Process memory, optionally snapshotted to a file
    Memory,
}

impl FromStr for QueueBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(QueueBackend::Sqlite),
            "memory" => Ok(QueueBackend::Memory),
            other => Err(ConfigError::InvalidBackend(other.to_string())),
        }
    }
}

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control API host address
    pub host: String,
    /// Control API port
    pub port: u16,
    pub backend: QueueBackend,
    /// sqlite connection URL, required for the sqlite backend
    pub database_url: Option<String>,
    /// Snapshot file for the memory backend
    pub snapshot_path: Option<PathBuf>,
    /// Base URL of the upstream REST API
    pub api_base_url: String,
    /// JSON document overriding the built-in type policies
    pub policy_file: Option<PathBuf>,
    pub max_queue_size: usize,
    /// How long terminal operations are kept for inspection
    pub audit_retention: Duration,
    pub sync_interval: Duration,
    /// Upper bound on a single handler call
    pub attempt_timeout: Duration,
    pub token_check_interval: Duration,
    /// Refresh once the token has less than this left
    pub token_refresh_threshold: Duration,
    pub token_refresh_url: Option<String>,
    /// Bearer secret guarding the control API
    pub auth_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "4010".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = non_empty("DATABASE_URL");
        let backend = match non_empty("QUEUE_BACKEND") {
            Some(value) => value.parse()?,
            None if database_url.is_some() => QueueBackend::Sqlite,
            None => return Err(ConfigError::MissingDatabaseUrl),
        };
        if backend == QueueBackend::Sqlite && database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        let api_base_url = non_empty("API_BASE_URL").ok_or(ConfigError::MissingApiBaseUrl)?;

        Ok(Self {
            host,
            port,
            backend,
            database_url,
            snapshot_path: non_empty("SNAPSHOT_PATH").map(PathBuf::from),
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            policy_file: non_empty("POLICY_FILE").map(PathBuf::from),
            max_queue_size: parse_or("MAX_QUEUE_SIZE", 500)?,
            audit_retention: secs_or("AUDIT_RETENTION_SECS", 7 * 24 * 60 * 60)?,
            sync_interval: secs_or("SYNC_INTERVAL_SECS", 30)?,
            attempt_timeout: secs_or("ATTEMPT_TIMEOUT_SECS", 30)?,
            token_check_interval: secs_or("TOKEN_CHECK_INTERVAL_SECS", 60)?,
            token_refresh_threshold: secs_or("TOKEN_REFRESH_THRESHOLD_SECS", 300)?,
            token_refresh_url: non_empty("TOKEN_REFRESH_URL"),
            auth_secret: non_empty("AUTH_SECRET"),
        })
    }

    /// A memory-backed configuration with defaults, for tests and embedding.
    pub fn in_memory(api_base_url: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4010,
            backend: QueueBackend::Memory,
            database_url: None,
            snapshot_path: None,
            api_base_url: api_base_url.into(),
            policy_file: None,
            max_queue_size: 500,
            audit_retention: Duration::from_secs(7 * 24 * 60 * 60),
            sync_interval: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(30),
            token_check_interval: Duration::from_secs(60),
            token_refresh_threshold: Duration::from_secs(300),
            token_refresh_url: None,
            auth_secret: None,
        }
    }
}

fn non_empty(key: &'static str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match non_empty(key) {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidNumber(key)),
        None => Ok(default),
    }
}

fn secs_or(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_or(key, default).map(Duration::from_secs)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL is required unless QUEUE_BACKEND=memory")]
    MissingDatabaseUrl,

    #[error("API_BASE_URL environment variable is required")]
    MissingApiBaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid QUEUE_BACKEND value: {0} (expected sqlite or memory)")]
    InvalidBackend(String),

    #[error("Invalid numeric value for {0}")]
    InvalidNumber(&'static str),
}
