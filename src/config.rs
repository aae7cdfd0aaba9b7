//! Configuration module
//!
//! Loads configuration from environment variables. This crate never reads
//! config for its own sake at import time: `Config::from_env` is only
//! invoked by the demo binary; library consumers are free to construct
//! `Config` directly or build a `Storage` without it.

use std::env;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store location: the literal `":memory:"` opens a volatile SQLite
    /// database; any other string opens/creates a SQLite file at that
    /// path (`spec.md` §6.3).
    pub db_path: String,

    /// Maximum number of pooled connections to the backing store.
    pub max_connections: u32,

    /// Number of events between automatic snapshots taken by the demo
    /// binary. Not mandated by the spec; a host embedding this crate is
    /// free to call `EventStore::create_snapshot` on its own policy.
    pub snapshot_interval: u32,

    /// Environment name, used only to decide the demo binary's log
    /// verbosity.
    pub environment: String,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// sensible defaults for an embedded, in-memory engine.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = env::var("EVENT_STORE_DB_PATH").unwrap_or_else(|_| ":memory:".to_string());

        let max_connections = env::var("EVENT_STORE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("EVENT_STORE_MAX_CONNECTIONS"))?;

        let snapshot_interval = env::var("EVENT_STORE_SNAPSHOT_INTERVAL")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("EVENT_STORE_SNAPSHOT_INTERVAL"))?;

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        Ok(Self {
            db_path,
            max_connections,
            snapshot_interval,
            environment,
        })
    }

    /// Whether the configured store is a volatile, in-process database.
    pub fn is_in_memory(&self) -> bool {
        self.db_path == ":memory:"
    }

    /// Check if running in production.
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
