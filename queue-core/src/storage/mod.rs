pub mod file;
pub mod memory;
pub mod redis_backend;
pub mod sql;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BackendError;
use crate::task::{StatusFilter, Task, TaskUpdate};

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use redis_backend::RedisStorage;
pub use sql::SqlStorage;

/// The one boundary between the engine and persistence. Every backend
/// (in-memory, single-file JSON, Redis, relational, or a user-supplied
/// `Custom` implementation) satisfies exactly this contract; the engine
/// never reaches past it.
///
/// Implementations via `#[async_trait]` so the engine can hold
/// `Arc<dyn Storage>` rather than being generic over a storage type
/// parameter — this keeps the engine's public API (including the singleton
/// accessor) object-safe at the engine/worker boundary.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Durably add a task. No ordering guarantee beyond what priority and
    /// `created_at` encode.
    async fn enqueue(&self, task: Task) -> Result<(), BackendError>;

    /// Atomically select the highest-priority pending task, transition it
    /// to `processing`, and return it. Returns `None` if the queue holds no
    /// runnable task; never blocks.
    async fn dequeue(&self) -> Result<Option<Task>, BackendError>;

    /// Snapshot read, optionally filtered by status. May be eventually
    /// consistent per adapter.
    async fn load_tasks(&self, status: StatusFilter) -> Result<Vec<Task>, BackendError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, BackendError>;

    /// Apply a partial update. Compare-and-set is not required;
    /// last-writer-wins semantics are acceptable unless an adapter notes
    /// otherwise.
    async fn update_task(
        &self,
        id: Uuid,
        update: TaskUpdate,
    ) -> Result<Option<Task>, BackendError>;

    /// Soft delete flips `status` to `deleted`; hard delete removes the row
    /// outright.
    async fn delete_task(&self, id: Uuid, hard: bool) -> Result<Option<Task>, BackendError>;
}
