use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::OnceCell;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{BackendConfig, EngineConfig};
use crate::error::{BackendError, ConfigError, EngineError, InputError};
use crate::events::{Event, EventChannel, EventName, Listener};
use crate::registry::HandlerRegistry;
use crate::storage::{FileStorage, MemoryStorage, RedisStorage, SqlStorage, Storage};
use crate::task::{StatusFilter, Task, TaskStatus, TaskUpdate, MAX_RETRIES_HARD_CAP};

/// Per-task overrides accepted by `enqueue`, the highest-precedence layer of
/// the policy-resolution cascade (task override > handler default > engine
/// default).
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: i32,
    pub max_retries: Option<u32>,
    pub max_processing_time: Option<Duration>,
    /// Downgrade a validator rejection from an error to a `tracing::warn!`
    /// and enqueue anyway.
    pub skip_on_payload_error: bool,
}

/// The resolved `(max_retries, max_processing_time)` pair for one attempt,
/// computed once at attempt start per spec.md §9's `resolve()` design note
/// rather than re-read mid-attempt.
#[derive(Debug, Clone, Copy)]
pub struct EffectivePolicy {
    pub max_retries: u32,
    pub max_processing_time: Duration,
}

fn resolve_policy(
    task_override_retries: Option<u32>,
    task_override_timeout: Option<Duration>,
    handler_retries: Option<u32>,
    handler_timeout: Option<Duration>,
    engine: &EngineConfig,
) -> EffectivePolicy {
    EffectivePolicy {
        max_retries: task_override_retries
            .or(handler_retries)
            .unwrap_or(engine.max_retries),
        max_processing_time: task_override_timeout
            .or(handler_timeout)
            .unwrap_or(engine.max_processing_time),
    }
}

static SINGLETON: OnceCell<Arc<Engine>> = OnceCell::new();

/// Orchestrates enqueue, priority-ordered dequeue, retry accounting,
/// stuck-task reclamation and event emission; owns the task state machine.
///
/// Generic over `Arc<dyn Storage>` rather than a type parameter, so the
/// engine's public API (including the singleton accessor below) stays
/// object-safe at the engine/worker boundary.
pub struct Engine {
    storage: Arc<dyn Storage>,
    pub registry: Arc<HandlerRegistry>,
    pub events: Arc<EventChannel>,
    config: EngineConfig,
    pool: tokio::sync::Mutex<Option<crate::pool::WorkerPool>>,
    /// Self-reference so `start_worker` can hand the pool an owned
    /// `Arc<Engine>` from `&self`. Built with `Arc::new_cyclic` since
    /// `self: &Arc<Self>` receivers aren't available on stable Rust.
    self_ref: std::sync::Weak<Engine>,
}

impl Engine {
    pub fn new(storage: Arc<dyn Storage>, config: EngineConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            storage,
            registry: Arc::new(HandlerRegistry::new()),
            events: Arc::new(EventChannel::new()),
            config,
            pool: tokio::sync::Mutex::new(None),
            self_ref: self_ref.clone(),
        }))
    }

    fn arc(&self) -> Arc<Engine> {
        self.self_ref.upgrade().expect("Engine always holds a strong reference to itself")
    }

    pub async fn from_backend(
        backend: BackendConfig,
        config: EngineConfig,
    ) -> Result<Arc<Self>, EngineError> {
        let storage: Arc<dyn Storage> = match backend {
            BackendConfig::Memory => Arc::new(MemoryStorage::new()),
            BackendConfig::File { file_path } => {
                crate::config::validate_file_path(&file_path)?;
                Arc::new(FileStorage::new(file_path).map_err(EngineError::Backend)?)
            }
            BackendConfig::Redis { url, options } => {
                let prefix = options.storage_name.unwrap_or_else(|| "queue-manager".to_string());
                Arc::new(RedisStorage::new(&url, prefix).map_err(EngineError::Backend)?)
            }
            BackendConfig::Sql { pool, options } => {
                let sql = SqlStorage::new(&pool, options.table_name.as_deref())
                    .await
                    .map_err(EngineError::Backend)?;
                if options.use_migrate {
                    sql.migrate().await.map_err(EngineError::Backend)?;
                }
                Arc::new(sql)
            }
            BackendConfig::Custom { storage } => {
                tracing::warn!(
                    "using a custom storage adapter: atomic dequeue across processes is the \
                     implementer's responsibility, not the engine's"
                );
                storage
            }
        };

        Self::new(storage, config).map_err(EngineError::Config)
    }

    /// Process-global accessor implementing the `singleton` config flag
    /// (spec.md §5). When `config.singleton` is `false` the `OnceCell` is
    /// never touched and every call builds and returns a fresh engine. When
    /// `true` (the default), a second call — regardless of the backend it
    /// requests — logs a warning and returns the original instance; the
    /// singleton is a convenience, not a correctness boundary (spec.md §9).
    pub async fn instance(backend: BackendConfig, config: EngineConfig) -> Result<Arc<Self>, EngineError> {
        if !config.singleton {
            return Self::from_backend(backend, config).await;
        }

        if let Some(existing) = SINGLETON.get() {
            tracing::warn!(
                "Engine::instance called again with a (possibly different) backend \
                 configuration; returning the existing singleton instance"
            );
            return Ok(existing.clone());
        }

        let engine = Self::from_backend(backend, config).await?;
        match SINGLETON.set(engine.clone()) {
            Ok(()) => Ok(engine),
            Err(_) => Ok(SINGLETON.get().expect("just set").clone()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    pub fn on(&self, name: EventName, listener: Listener) {
        self.events.on(name, listener);
    }

    /// Start `concurrency` cooperative poller loops against this engine. A
    /// second call while a pool is already running is a no-op logged at
    /// warn level; call `stop_worker` first to change concurrency.
    pub async fn start_worker(&self, concurrency: usize) {
        self.start_worker_with_health(concurrency, None).await;
    }

    pub async fn start_worker_with_health(
        &self,
        concurrency: usize,
        health: Option<crate::health::HealthHandle>,
    ) {
        let mut guard = self.pool.lock().await;
        if guard.is_some() {
            tracing::warn!("start_worker called while a worker pool is already running");
            return;
        }

        let mut pool = crate::pool::WorkerPool::new(self.arc(), concurrency);
        if let Some(health) = health {
            pool = pool.with_health(health);
        }
        pool.start();
        *guard = Some(pool);
    }

    /// Cooperatively stop the running worker pool, waiting for in-flight
    /// handler invocations to finish. A no-op if no pool is running.
    pub async fn stop_worker(&self) {
        let mut guard = self.pool.lock().await;
        if let Some(mut pool) = guard.take() {
            pool.stop().await;
        }
    }

    /// Creates a task with resolved policy, assigns an id, persists it as
    /// `pending`, and emits `taskAdded`.
    pub async fn enqueue(
        &self,
        handler_name: &str,
        payload: Value,
        overrides: EnqueueOptions,
    ) -> Result<Task, EngineError> {
        if let Some(max_retries) = overrides.max_retries {
            if max_retries > MAX_RETRIES_HARD_CAP {
                return Err(EngineError::Config(ConfigError::MaxRetriesOverCap {
                    requested: max_retries,
                    cap: MAX_RETRIES_HARD_CAP,
                }));
            }
        }

        let entry = self.registry.get(handler_name);
        if entry.is_none() && self.config.require_registered_handler {
            return Err(EngineError::Input(InputError::HandlerNotRegistered(
                handler_name.to_string(),
            )));
        }

        let validation = self.registry.validate(handler_name, &payload);
        if !validation.valid {
            let message = validation.message.unwrap_or_else(|| "payload rejected".to_string());
            if overrides.skip_on_payload_error {
                tracing::warn!(handler = handler_name, %message, "enqueuing despite invalid payload");
            } else {
                return Err(EngineError::Input(InputError::InvalidPayload {
                    handler: handler_name.to_string(),
                    message,
                }));
            }
        }

        let policy = resolve_policy(
            overrides.max_retries,
            overrides.max_processing_time,
            entry.as_ref().and_then(|e| e.max_retries),
            entry.as_ref().and_then(|e| e.max_processing_time),
            &self.config,
        );

        let now = Utc::now();
        let task = Task {
            id: Uuid::now_v7(),
            handler: handler_name.to_string(),
            payload,
            status: TaskStatus::Pending,
            priority: overrides.priority,
            created_at: now,
            updated_at: now,
            max_retries: policy.max_retries,
            max_processing_time: policy.max_processing_time,
            retry_count: 0,
            log: None,
            reclaim_count: 0,
        };

        self.storage.enqueue(task.clone()).await.map_err(EngineError::Backend)?;
        self.events.emit(Event::TaskAdded(task.clone()));
        Ok(task)
    }

    /// Atomically flips the next runnable task from `pending` to
    /// `processing` and returns it. On an empty queue, opportunistically
    /// triggers stuck-task reclamation before returning `None` — never
    /// blocks.
    pub async fn dequeue(&self) -> Result<Option<Task>, EngineError> {
        match self.storage.dequeue().await.map_err(EngineError::Backend)? {
            Some(task) => Ok(Some(task)),
            None => {
                self.reclaim_stuck_tasks().await?;
                Ok(None)
            }
        }
    }

    pub async fn update_task(&self, id: Uuid, update: TaskUpdate) -> Result<Option<Task>, EngineError> {
        if let Some(new_status) = update.status {
            if let Some(current) = self.storage.get_task(id).await.map_err(EngineError::Backend)? {
                if current.status != new_status && !current.status.can_transition_to(new_status) {
                    return Err(EngineError::InvalidTransition {
                        from: current.status.to_string(),
                        to: new_status.to_string(),
                    });
                }
            }
        }

        self.storage.update_task(id, update).await.map_err(EngineError::Backend)
    }

    pub async fn get_task_by_id(&self, id: Uuid) -> Result<Option<Task>, EngineError> {
        self.storage.get_task(id).await.map_err(EngineError::Backend)
    }

    pub async fn get_all_tasks(&self, status: StatusFilter) -> Result<Vec<Task>, EngineError> {
        self.storage.load_tasks(status).await.map_err(EngineError::Backend)
    }

    /// Soft delete (the default) is subject to the same transition-legality
    /// check as `update_task` — `status → deleted` must be one of the
    /// legal transitions listed in spec.md §3 (so a `processing` task can't
    /// be soft-deleted out from under its worker) — and is idempotent: a
    /// second soft-delete of an already-`deleted` task is a no-op that
    /// emits no extra `taskRemoved`. Hard delete removes the row outright
    /// regardless of status.
    pub async fn delete_task(&self, id: Uuid, hard: bool) -> Result<Option<Task>, EngineError> {
        if hard {
            let deleted = self.storage.delete_task(id, true).await.map_err(EngineError::Backend)?;
            if let Some(task) = &deleted {
                self.events.emit(Event::TaskRemoved(task.clone()));
            }
            return Ok(deleted);
        }

        let Some(current) = self.storage.get_task(id).await.map_err(EngineError::Backend)? else {
            return Ok(None);
        };

        if current.status == TaskStatus::Deleted {
            return Ok(Some(current));
        }

        if !current.status.can_transition_to(TaskStatus::Deleted) {
            return Err(EngineError::InvalidTransition {
                from: current.status.to_string(),
                to: TaskStatus::Deleted.to_string(),
            });
        }

        let deleted = self.storage.delete_task(id, false).await.map_err(EngineError::Backend)?;
        if let Some(task) = &deleted {
            self.events.emit(Event::TaskRemoved(task.clone()));
        }
        Ok(deleted)
    }

    /// Scans `processing` tasks for ones whose owner appears to have died
    /// (`now - updated_at > max_processing_time`, strict `>`). Each stuck
    /// task either goes back to `pending` with `retry_count` incremented, or
    /// straight to `failed` if its budget (or the poison-pill reclaim-count
    /// backstop) is exhausted.
    ///
    /// This is the sole authoritative path for timeout-driven retries — see
    /// DESIGN.md's resolution of the source's double-increment risk.
    /// Handler-exception retries are accounted for exclusively by the
    /// worker pool and never touch this path.
    pub async fn reclaim_stuck_tasks(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        let processing = self
            .storage
            .load_tasks(Some(TaskStatus::Processing))
            .await
            .map_err(EngineError::Backend)?;

        let mut reclaimed = 0;
        for task in processing.into_iter().filter(|t| t.is_stuck(now)) {
            self.events.emit(Event::TaskStuck(task.clone()));

            let exhausted_retries = task.retry_count >= task.max_retries;
            let is_poison_pill = task.reclaim_count + 1 >= self.config.max_reclaim_count;

            if exhausted_retries || is_poison_pill {
                let log = if is_poison_pill && !exhausted_retries {
                    format!(
                        "exceeded {} reclaim attempts without completing; treated as a poison pill",
                        self.config.max_reclaim_count
                    )
                } else {
                    format!("exceeded {}/{} retries", task.retry_count, task.max_retries)
                };

                let update = TaskUpdate::status(TaskStatus::Failed)
                    .with_log(log)
                    .with_retry_count(task.retry_count)
                    .with_reclaim_count(task.reclaim_count + 1);
                if let Some(updated) = self.storage.update_task(task.id, update).await.map_err(EngineError::Backend)? {
                    self.events.emit(Event::TaskFailed(updated, "stuck: retries exhausted".to_string()));
                }
            } else {
                let update = TaskUpdate::status(TaskStatus::Pending)
                    .with_retry_count(task.retry_count + 1)
                    .with_reclaim_count(task.reclaim_count + 1);
                if let Some(updated) = self.storage.update_task(task.id, update).await.map_err(EngineError::Backend)? {
                    self.events.emit(Event::TaskRetried(updated));
                }
            }

            reclaimed += 1;
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegisterOptions;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl crate::registry::Handler for Noop {
        async fn call(&self, _payload: Value) -> Result<(), String> {
            Ok(())
        }
    }

    async fn memory_engine(config: EngineConfig) -> Arc<Engine> {
        Engine::new(Arc::new(MemoryStorage::new()), config).unwrap()
    }

    #[tokio::test]
    async fn enqueue_rejects_unregistered_handler_under_strict_mode() {
        let engine = memory_engine(EngineConfig::default()).await;
        let result = engine.enqueue("ghost", Value::Null, EnqueueOptions::default()).await;
        assert!(matches!(result, Err(EngineError::Input(InputError::HandlerNotRegistered(_)))));
    }

    #[tokio::test]
    async fn enqueue_rejects_max_retries_over_cap() {
        let engine = memory_engine(EngineConfig::default()).await;
        engine.registry.register("job", Arc::new(Noop), RegisterOptions::default());

        let result = engine
            .enqueue(
                "job",
                Value::Null,
                EnqueueOptions {
                    max_retries: Some(MAX_RETRIES_HARD_CAP + 1),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(EngineError::Config(ConfigError::MaxRetriesOverCap { .. }))));
    }

    #[tokio::test]
    async fn enqueue_load_roundtrips_nontimestamp_fields() {
        let engine = memory_engine(EngineConfig::default()).await;
        engine.registry.register("job", Arc::new(Noop), RegisterOptions::default());

        let task = engine
            .enqueue("job", serde_json::json!({"x": 1}), EnqueueOptions { priority: 5, ..Default::default() })
            .await
            .unwrap();

        let loaded = engine.get_task_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.handler, task.handler);
        assert_eq!(loaded.payload, task.payload);
        assert_eq!(loaded.priority, task.priority);
        assert_eq!(loaded.max_retries, task.max_retries);
        assert_eq!(loaded.retry_count, 0);
    }

    #[tokio::test]
    async fn dequeue_on_empty_queue_returns_none_without_blocking() {
        let engine = memory_engine(EngineConfig::default()).await;
        assert!(engine.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaim_retries_then_fails_a_stuck_task() {
        let engine = memory_engine(EngineConfig {
            max_retries: 1,
            ..EngineConfig::default()
        })
        .await;
        engine.registry.register("job", Arc::new(Noop), RegisterOptions::default());

        let task = engine
            .enqueue(
                "job",
                Value::Null,
                EnqueueOptions {
                    max_processing_time: Some(Duration::from_millis(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let dequeued = engine.dequeue().await.unwrap().unwrap();
        assert_eq!(dequeued.id, task.id);

        tokio::time::sleep(Duration::from_millis(5)).await;

        engine.reclaim_stuck_tasks().await.unwrap();
        let after_first = engine.get_task_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(after_first.status, TaskStatus::Pending);
        assert_eq!(after_first.retry_count, 1);

        let redequeued = engine.dequeue().await.unwrap().unwrap();
        assert_eq!(redequeued.id, task.id);
        tokio::time::sleep(Duration::from_millis(5)).await;

        engine.reclaim_stuck_tasks().await.unwrap();
        let after_second = engine.get_task_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(after_second.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn soft_delete_is_idempotent_and_emits_once_per_call() {
        let engine = memory_engine(EngineConfig::default()).await;
        engine.registry.register("job", Arc::new(Noop), RegisterOptions::default());
        let task = engine.enqueue("job", Value::Null, EnqueueOptions::default()).await.unwrap();

        let removed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = removed.clone();
        engine.on(
            EventName::TaskRemoved,
            Arc::new(move |_| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );

        let first = engine.delete_task(task.id, false).await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Deleted);
        let second = engine.delete_task(task.id, false).await.unwrap().unwrap();
        assert_eq!(second.status, TaskStatus::Deleted);
        assert_eq!(removed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn soft_delete_of_a_processing_task_is_rejected() {
        let engine = memory_engine(EngineConfig::default()).await;
        engine.registry.register("job", Arc::new(Noop), RegisterOptions::default());
        let task = engine.enqueue("job", Value::Null, EnqueueOptions::default()).await.unwrap();
        engine.dequeue().await.unwrap();

        let result = engine.delete_task(task.id, false).await;
        assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));

        let unchanged = engine.get_task_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn hard_delete_of_a_processing_task_is_allowed() {
        let engine = memory_engine(EngineConfig::default()).await;
        engine.registry.register("job", Arc::new(Noop), RegisterOptions::default());
        let task = engine.enqueue("job", Value::Null, EnqueueOptions::default()).await.unwrap();
        engine.dequeue().await.unwrap();

        let removed = engine.delete_task(task.id, true).await.unwrap().unwrap();
        assert_eq!(removed.status, TaskStatus::Processing);
        assert!(engine.get_task_by_id(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_status_transition_is_rejected() {
        let engine = memory_engine(EngineConfig::default()).await;
        engine.registry.register("job", Arc::new(Noop), RegisterOptions::default());
        let task = engine.enqueue("job", Value::Null, EnqueueOptions::default()).await.unwrap();

        let result = engine.update_task(task.id, TaskUpdate::status(TaskStatus::Done)).await;
        assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn instance_with_singleton_false_returns_a_fresh_engine_every_call() {
        let config = EngineConfig {
            singleton: false,
            ..EngineConfig::default()
        };
        let first = Engine::instance(BackendConfig::Memory, config.clone()).await.unwrap();
        let second = Engine::instance(BackendConfig::Memory, config).await.unwrap();
        assert!(
            !Arc::ptr_eq(&first, &second),
            "singleton: false must skip the OnceCell and build a fresh engine each call"
        );
    }

    #[tokio::test]
    async fn instance_with_singleton_true_returns_the_same_engine_every_call() {
        let config = EngineConfig {
            singleton: true,
            ..EngineConfig::default()
        };
        let first = Engine::instance(BackendConfig::Memory, config.clone()).await.unwrap();
        let second = Engine::instance(BackendConfig::Memory, config).await.unwrap();
        assert!(
            Arc::ptr_eq(&first, &second),
            "singleton: true must hand back the same process-global instance on a second call"
        );
    }
}
