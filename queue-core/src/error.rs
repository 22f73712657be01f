use thiserror::Error;

/// Fatal at construction: an unknown backend, a `maxRetries` override over
/// the hard cap, or anything else that makes the engine un-constructible.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown backend {0:?}")]
    UnknownBackend(String),
    #[error("maxRetries override {requested} exceeds the system hard cap of {cap}")]
    MaxRetriesOverCap { requested: u32, cap: u32 },
    #[error("file backend requires a .json path, got {0:?}")]
    InvalidFileExtension(String),
    #[error("conflicting backend/process-type configuration: {0}")]
    ConflictingConfig(String),
}

/// Surfaced to the caller of `addTask`; optionally downgraded to a warning
/// when the caller opts into `skipOnPayloadError`.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("handler {0:?} is not registered")]
    HandlerNotRegistered(String),
    #[error("payload rejected by validator for handler {handler:?}: {message}")]
    InvalidPayload { handler: String, message: String },
}

/// Transient read/write failures from a storage adapter. Never swallowed by
/// the engine; propagated to the caller, and treated as fatal to the current
/// attempt (but not to the worker pool) when raised from a worker.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

/// The union the engine's public operations return. Aggregates the three
/// categories above via `#[from]`, keeping config/input/backend failures
/// distinguishable at the call site.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}
