use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hard upper bound on `max_retries`, regardless of what a task, handler, or
/// engine default requests.
pub const MAX_RETRIES_HARD_CAP: u32 = 10;

/// Status of a [`Task`] in its lifecycle. Internally the terminal success
/// state is always `Done`; `taskCompleted` is the name of the event emitted
/// when a task reaches it, not a separate status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Failed,
    Deleted,
}

impl TaskStatus {
    /// Whether transitioning from `self` to `next` is a legal status
    /// transition per the engine's state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Done)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Pending, Deleted)
                | (Failed, Deleted)
                | (Done, Deleted)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A unit of work bound to a registered handler name, carrying an opaque
/// payload and the engine's bookkeeping for retries, timeouts and ordering.
///
/// The engine never mutates `id`, `handler`, `payload`, `created_at`,
/// `max_retries`, `max_processing_time` or `priority` after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub handler: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub max_processing_time: StdDuration,
    pub retry_count: u32,
    pub log: Option<String>,
    /// Internal bookkeeping: number of times the stuck detector has reset
    /// this task from `processing` back to `pending`, independent of
    /// `retry_count`. Backs the poison-pill backstop in the janitor; never
    /// required on `addTask` and never part of any spec-level invariant.
    #[serde(default)]
    pub reclaim_count: u32,
}

impl Task {
    /// Total order used by every storage adapter's dequeue selection:
    /// `(priority desc, created_at asc, id asc)`.
    pub fn ordering_key(&self) -> (std::cmp::Reverse<i32>, DateTime<Utc>, Uuid) {
        (std::cmp::Reverse(self.priority), self.created_at, self.id)
    }

    pub fn is_stuck(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing
            && match chrono::Duration::from_std(self.max_processing_time) {
                Ok(budget) => now - self.updated_at > budget,
                Err(_) => false,
            }
    }
}

/// A partial update applied by `Engine::update_task`. Only the fields that
/// are `Some` are mutated; `updated_at` is always bumped to now by the
/// engine before the update is handed to storage.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub log: Option<String>,
    pub retry_count: Option<u32>,
    pub reclaim_count: Option<u32>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_reclaim_count(mut self, reclaim_count: u32) -> Self {
        self.reclaim_count = Some(reclaim_count);
        self
    }
}

/// Filter applied to `getAllTasks` / `loadTasks`.
pub type StatusFilter = Option<TaskStatus>;

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Done));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Deleted));
        assert!(Failed.can_transition_to(Deleted));
        assert!(Done.can_transition_to(Deleted));

        assert!(!Done.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Deleted.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Done));
    }

    #[test]
    fn stuck_requires_strict_inequality() {
        let now = Utc::now();
        let mut task = sample_task();
        task.status = TaskStatus::Processing;
        task.max_processing_time = StdDuration::from_millis(100);
        task.updated_at = now - chrono::Duration::milliseconds(100);
        assert!(!task.is_stuck(now), "exactly at the boundary is not stuck");

        task.updated_at = now - chrono::Duration::milliseconds(101);
        assert!(task.is_stuck(now));
    }

    fn sample_task() -> Task {
        Task {
            id: Uuid::now_v7(),
            handler: "noop".into(),
            payload: serde_json::json!({}),
            status: TaskStatus::Pending,
            priority: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            max_retries: 3,
            max_processing_time: StdDuration::from_secs(600),
            retry_count: 0,
            log: None,
            reclaim_count: 0,
        }
    }
}
