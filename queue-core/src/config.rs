use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::storage::Storage;
use crate::task::MAX_RETRIES_HARD_CAP;

/// Connection-pool parameters for the SQL backend, kept separate from
/// `BackendConfig` to separate "how to connect" from "what backend".
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// SQL-backend specific knobs layered on top of `PoolConfig`.
#[derive(Debug, Clone, Default)]
pub struct SqlOptions {
    pub schema: Option<String>,
    pub table_name: Option<String>,
    pub use_migrate: bool,
}

/// Redis-backend specific knobs.
#[derive(Debug, Clone)]
pub struct RedisOptions {
    pub storage_name: Option<String>,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            storage_name: Some("queue-manager".to_string()),
        }
    }
}

/// Discriminated union selecting the storage adapter and its parameters,
/// per spec.md §3/§6.
pub enum BackendConfig {
    Memory,
    File {
        file_path: PathBuf,
    },
    Redis {
        url: String,
        options: RedisOptions,
    },
    Sql {
        pool: PoolConfig,
        options: SqlOptions,
    },
    Custom {
        storage: Arc<dyn Storage>,
    },
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendConfig::Memory => write!(f, "Memory"),
            BackendConfig::File { file_path } => {
                f.debug_struct("File").field("file_path", file_path).finish()
            }
            BackendConfig::Redis { options, .. } => {
                f.debug_struct("Redis").field("options", options).finish()
            }
            BackendConfig::Sql { options, .. } => {
                f.debug_struct("Sql").field("options", options).finish()
            }
            BackendConfig::Custom { .. } => write!(f, "Custom(..)"),
        }
    }
}

/// Engine-level configuration, the options enumerated in spec.md §6.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Poll interval used by worker pollers between dequeue attempts, ms.
    pub delay: Duration,
    pub singleton: bool,
    pub max_retries: u32,
    pub max_processing_time: Duration,
    pub crash_on_worker_error: bool,
    /// When true (the default), `enqueue` rejects payloads for handlers
    /// that were never `register`ed. When false, unregistered handlers are
    /// accepted and dispatched lazily at worker time (useful for producers
    /// that run in a different process than the one holding the registry).
    pub require_registered_handler: bool,
    /// How many times the stuck detector may reset a task back to `pending`
    /// before treating it as a poison pill and failing it outright, even if
    /// `retry_count` budget remains. Grounded on
    /// `cyclotron_jobs.janitor_touch_count` / `detect_poison_pills`.
    pub max_reclaim_count: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            singleton: true,
            max_retries: 3,
            max_processing_time: Duration::from_secs(600),
            crash_on_worker_error: false,
            require_registered_handler: true,
            max_reclaim_count: 5,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries > MAX_RETRIES_HARD_CAP {
            return Err(ConfigError::MaxRetriesOverCap {
                requested: self.max_retries,
                cap: MAX_RETRIES_HARD_CAP,
            });
        }
        Ok(())
    }
}

pub fn validate_file_path(path: &std::path::Path) -> Result<(), ConfigError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(()),
        _ => Err(ConfigError::InvalidFileExtension(
            path.to_string_lossy().into_owned(),
        )),
    }
}
