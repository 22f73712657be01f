use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::BackendError;
use crate::task::{StatusFilter, Task, TaskStatus, TaskUpdate};

use super::Storage;

/// A single process-local task list. The `Mutex` both guards the list and
/// serves as spec.md's "boolean dequeue lock": holding it for the duration
/// of a dequeue's read-then-flip is what makes concurrent pollers within
/// one process observe each pending task exactly once.
///
/// Durability: none. All state is lost on restart. Suitable only for
/// single-process use — sharing this adapter across processes gives no
/// cross-process atomicity guarantee.
#[derive(Default)]
pub struct MemoryStorage {
    tasks: Mutex<Vec<Task>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn enqueue(&self, task: Task) -> Result<(), BackendError> {
        self.tasks.lock().expect("poisoned MemoryStorage lock").push(task);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Task>, BackendError> {
        let mut tasks = self.tasks.lock().expect("poisoned MemoryStorage lock");
        let index = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .min_by_key(|(_, t)| t.ordering_key())
            .map(|(i, _)| i);

        let Some(index) = index else {
            return Ok(None);
        };

        let task = &mut tasks[index];
        task.status = TaskStatus::Processing;
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn load_tasks(&self, status: StatusFilter) -> Result<Vec<Task>, BackendError> {
        let tasks = self.tasks.lock().expect("poisoned MemoryStorage lock");
        Ok(tasks
            .iter()
            .filter(|t| status.map(|s| s == t.status).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, BackendError> {
        let tasks = self.tasks.lock().expect("poisoned MemoryStorage lock");
        Ok(tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn update_task(
        &self,
        id: Uuid,
        update: TaskUpdate,
    ) -> Result<Option<Task>, BackendError> {
        let mut tasks = self.tasks.lock().expect("poisoned MemoryStorage lock");
        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(None);
        };

        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(log) = update.log {
            task.log = Some(log);
        }
        if let Some(retry_count) = update.retry_count {
            task.retry_count = retry_count;
        }
        if let Some(reclaim_count) = update.reclaim_count {
            task.reclaim_count = reclaim_count;
        }
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn delete_task(&self, id: Uuid, hard: bool) -> Result<Option<Task>, BackendError> {
        let mut tasks = self.tasks.lock().expect("poisoned MemoryStorage lock");
        if hard {
            return Ok(tasks
                .iter()
                .position(|t| t.id == id)
                .map(|index| tasks.remove(index)));
        }

        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(None);
        };
        task.status = TaskStatus::Deleted;
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn new_task(handler: &str, priority: i32) -> Task {
        Task {
            id: Uuid::now_v7(),
            handler: handler.to_string(),
            payload: serde_json::json!({}),
            status: TaskStatus::Pending,
            priority,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            max_retries: 3,
            max_processing_time: Duration::from_secs(600),
            retry_count: 0,
            log: None,
            reclaim_count: 0,
        }
    }

    #[tokio::test]
    async fn dequeue_orders_by_priority_then_fifo() {
        let storage = MemoryStorage::new();
        let a = new_task("noop", 0);
        storage.enqueue(a.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let b = new_task("noop", 5);
        storage.enqueue(b.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let c = new_task("noop", 5);
        storage.enqueue(c.clone()).await.unwrap();

        let first = storage.dequeue().await.unwrap().unwrap();
        assert_eq!(first.id, b.id);
        let second = storage.dequeue().await.unwrap().unwrap();
        assert_eq!(second.id, c.id);
        let third = storage.dequeue().await.unwrap().unwrap();
        assert_eq!(third.id, a.id);
        assert!(storage.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_on_empty_queue_returns_none() {
        let storage = MemoryStorage::new();
        assert!(storage.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn soft_delete_is_idempotent() {
        let storage = MemoryStorage::new();
        let task = new_task("noop", 0);
        storage.enqueue(task.clone()).await.unwrap();

        let first = storage.delete_task(task.id, false).await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Deleted);
        let second = storage.delete_task(task.id, false).await.unwrap().unwrap();
        assert_eq!(second.status, TaskStatus::Deleted);
    }
}
