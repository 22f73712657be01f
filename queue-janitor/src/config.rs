use envconfig::Envconfig;

/// Environment-driven configuration for the janitor process. The janitor
/// shares the same backend-selection surface as the worker since it opens
/// an independent connection to the same storage, never the same process.
#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

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

    #[envconfig(from = "MAX_PG_CONNECTIONS", default = "5")]
    pub max_pg_connections: u32,

    #[envconfig(from = "MAX_RETRIES", default = "3")]
    pub max_retries: u32,

    #[envconfig(from = "MAX_PROCESSING_TIME_SECONDS", default = "600")]
    pub max_processing_time_seconds: u64,

    #[envconfig(from = "MAX_RECLAIM_COUNT", default = "5")]
    pub max_reclaim_count: u32,

    /// How often the janitor sweeps for stuck tasks, independent of the
    /// opportunistic check workers run on an empty dequeue.
    #[envconfig(from = "CLEANUP_INTERVAL_SECONDS", default = "60")]
    pub cleanup_interval_seconds: u64,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
