use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::engine::Engine;
use crate::events::Event;
use crate::health::HealthHandle;
use crate::task::{Task, TaskStatus, TaskUpdate};

/// Cooperative fixed-size pool of task pollers: each poller dequeues, looks
/// the handler up in the registry, runs it under a timeout, and records a
/// terminal status. Concurrency is bounded by a `tokio::sync::Semaphore`
/// rather than one OS thread per worker — an async-task-per-permit model.
pub struct WorkerPool {
    engine: Arc<Engine>,
    concurrency: usize,
    active: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    health: Option<HealthHandle>,
}

/// Extra time given to a handler beyond its own `max_processing_time`
/// before the poller gives up waiting on it and lets the stuck detector
/// reclaim it instead of double-counting the timeout here.
const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

impl WorkerPool {
    pub fn new(engine: Arc<Engine>, concurrency: usize) -> Self {
        Self {
            engine,
            concurrency,
            active: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthHandle) -> Self {
        self.health = Some(health);
        self
    }

    /// Spawn `concurrency` poller tasks and return immediately. Each poller
    /// runs until `stop` flips the shared flag; in-flight handler
    /// invocations are allowed to finish rather than being aborted.
    pub fn start(&mut self) {
        self.active.store(true, Ordering::SeqCst);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        for worker_index in 0..self.concurrency {
            let engine = self.engine.clone();
            let active = self.active.clone();
            let semaphore = semaphore.clone();
            let health = self.health.clone();
            let concurrency = self.concurrency;

            let handle = tokio::spawn(async move {
                poll_loop(engine, active, semaphore, concurrency, health, worker_index).await;
            });
            self.handles.push(handle);
        }
    }

    /// Flip the cooperative stop flag. Returns once every poller has
    /// observed it and its handler invocations (if any) have completed.
    pub async fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

async fn poll_loop(
    engine: Arc<Engine>,
    active: Arc<AtomicBool>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    health: Option<HealthHandle>,
    worker_index: usize,
) {
    let in_flight = Arc::new(AtomicU64::new(0));
    let delay = engine.config().delay;

    while active.load(Ordering::SeqCst) {
        if let Some(health) = &health {
            health.report_healthy().await;
        }
        report_saturation(&in_flight, concurrency);

        let task = match engine.dequeue().await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(err) => {
                tracing::warn!(worker = worker_index, error = %err, "dequeue failed");
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let engine = engine.clone();
        let in_flight = in_flight.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);
        report_saturation(&in_flight, concurrency);

        let crash_on_worker_error = engine.config().crash_on_worker_error;
        let outcome = run_task(&engine, task.clone()).await;
        in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        if let TaskOutcome::HandlerError(fatal) = outcome {
            if crash_on_worker_error {
                tracing::error!(task = %task.id, error = %fatal, "handler error is fatal under crash_on_worker_error, stopping pool");
                active.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
}

fn report_saturation(in_flight: &AtomicU64, concurrency: usize) {
    let in_use = in_flight.load(Ordering::SeqCst) as f64;
    let percent = if concurrency == 0 { 0.0 } else { (in_use / concurrency as f64) * 100.0 };
    metrics::gauge!("queue_worker_saturation_percent").set(percent);
}

/// How a task attempt ended. Distinguishes a handler-thrown error from a
/// timeout or a missing registry entry so the poll loop can scope
/// `crash_on_worker_error` to handler exceptions only — spec.md §4.4 point 6
/// names "handler error" specifically; timeouts (point 5) and a missing
/// registration are handled separately and never trip it.
enum TaskOutcome {
    Success,
    HandlerError(String),
    Timeout,
    HandlerMissing,
}

/// Run one task's handler to completion, apply the terminal update, and
/// emit the matching lifecycle event.
async fn run_task(engine: &Arc<Engine>, task: Task) -> TaskOutcome {
    engine.events.emit(Event::TaskStarted(task.clone()));

    let Some(entry) = engine.registry.get(&task.handler) else {
        let update = TaskUpdate::status(TaskStatus::Failed)
            .with_log(format!("no handler registered for {:?}", task.handler));
        if let Ok(Some(updated)) = engine.update_task(task.id, update).await {
            engine.events.emit(Event::TaskFailed(updated, "handler not registered".to_string()));
        }
        return TaskOutcome::HandlerMissing;
    };

    let timeout = task.max_processing_time + TIMEOUT_GRACE;
    let result = tokio::time::timeout(timeout, entry.handler.call(task.payload.clone())).await;

    match result {
        Ok(Ok(())) => {
            let update = TaskUpdate::status(TaskStatus::Done);
            if let Ok(Some(updated)) = engine.update_task(task.id, update).await {
                engine.events.emit(Event::TaskCompleted(updated));
            }
            TaskOutcome::Success
        }
        Ok(Err(message)) => {
            fail_or_retry(engine, task, message.clone()).await;
            TaskOutcome::HandlerError(message)
        }
        Err(_) => {
            // The handler itself is still running past its budget; leave the
            // task in `processing` and let the stuck detector reclaim it so
            // a timeout is never accounted for twice.
            tracing::warn!(task = %task.id, "handler exceeded its processing budget; leaving to stuck detection");
            TaskOutcome::Timeout
        }
    }
}

/// Exception-driven retry accounting — the sole path that increments
/// `retry_count` for a handler-thrown error. Timeout-driven retries are
/// handled exclusively by `Engine::reclaim_stuck_tasks`; the two paths
/// never touch the same counter update within the same attempt.
///
/// `taskFailed` is emitted unconditionally for the attempt itself (spec.md
/// §8 scenario S2's event sequence requires `failed` before `retried` even
/// when retry budget remains), then `taskRetried` follows if the task goes
/// back to `pending`, or a second `taskFailed` carrying the terminal row
/// follows if retries are exhausted.
async fn fail_or_retry(engine: &Arc<Engine>, task: Task, message: String) {
    engine.events.emit(Event::TaskFailed(task.clone(), message.clone()));

    if task.retry_count >= task.max_retries {
        let update = TaskUpdate::status(TaskStatus::Failed)
            .with_log(message.clone())
            .with_retry_count(task.retry_count);
        if let Ok(Some(updated)) = engine.update_task(task.id, update).await {
            engine.events.emit(Event::TaskFailed(updated, message));
        }
    } else {
        let update = TaskUpdate::status(TaskStatus::Pending)
            .with_log(message)
            .with_retry_count(task.retry_count + 1);
        if let Ok(Some(updated)) = engine.update_task(task.id, update).await {
            engine.events.emit(Event::TaskRetried(updated));
        }
    }
}
