//! Durable, handler-dispatched background task queue.
//!
//! [`engine::Engine`] is the orchestrator: it owns a pluggable
//! [`storage::Storage`] adapter, a [`registry::HandlerRegistry`] and an
//! [`events::EventChannel`], and exposes enqueue/dequeue/update/delete plus
//! the worker-pool lifecycle (`start_worker`/`stop_worker`) as a single
//! object-safe API.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod storage;
pub mod task;

pub use config::{BackendConfig, EngineConfig, PoolConfig, RedisOptions, SqlOptions};
pub use engine::{EffectivePolicy, Engine, EnqueueOptions};
pub use error::{BackendError, ConfigError, EngineError, InputError};
pub use events::{Event, EventChannel, EventName, Listener};
pub use pool::WorkerPool;
pub use registry::{Handler, HandlerRegistry, RegisterOptions, Validation, ValidationResult, Validator};
pub use storage::Storage;
pub use task::{StatusFilter, Task, TaskStatus, TaskUpdate, MAX_RETRIES_HARD_CAP};
