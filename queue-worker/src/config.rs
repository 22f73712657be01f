use envconfig::Envconfig;

/// Environment-driven configuration for the worker process: bind address,
/// backend selection, and pool tuning all read from the environment rather
/// than a CLI flag set.
#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    /// `memory`, `file`, `redis`, or `sql`.
    #[envconfig(from = "QUEUE_BACKEND", default = "memory")]
    pub backend: String,

    #[envconfig(from = "QUEUE_FILE_PATH", default = "./queue.json")]
    pub file_path: String,

    #[envconfig(from = "QUEUE_REDIS_URL", default = "redis://localhost:6379")]
    pub redis_url: String,

    #[envconfig(from = "QUEUE_REDIS_NAMESPACE", default = "queue-manager")]
    pub redis_namespace: String,

    #[envconfig(from = "DATABASE_URL", default = "")]
    pub database_url: String,

    #[envconfig(from = "QUEUE_TABLE_NAME", default = "tasks")]
    pub table_name: String,

    #[envconfig(from = "MAX_PG_CONNECTIONS", default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(from = "MAX_CONCURRENT_JOBS", default = "10")]
    pub max_concurrent_jobs: usize,

    #[envconfig(from = "POLL_INTERVAL_MS", default = "1000")]
    pub poll_interval_ms: u64,

    #[envconfig(from = "MAX_RETRIES", default = "3")]
    pub max_retries: u32,

    #[envconfig(from = "MAX_PROCESSING_TIME_SECONDS", default = "600")]
    pub max_processing_time_seconds: u64,

    #[envconfig(from = "CRASH_ON_WORKER_ERROR", default = "false")]
    pub crash_on_worker_error: bool,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
