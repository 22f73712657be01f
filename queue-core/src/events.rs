use std::sync::{Arc, RwLock};

use crate::task::Task;

/// The event names enumerated in spec.md §6. `Completed`'s internal status
/// is always `TaskStatus::Done` (see DESIGN.md open question 2) — the event
/// name follows spec vocabulary, the status value follows the engine's.
#[derive(Debug, Clone)]
pub enum Event {
    TaskAdded(Task),
    TaskStarted(Task),
    TaskCompleted(Task),
    TaskFailed(Task, String),
    TaskRetried(Task),
    TaskRemoved(Task),
    TaskStuck(Task),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::TaskAdded(_) => "taskAdded",
            Event::TaskStarted(_) => "taskStarted",
            Event::TaskCompleted(_) => "taskCompleted",
            Event::TaskFailed(_, _) => "taskFailed",
            Event::TaskRetried(_) => "taskRetried",
            Event::TaskRemoved(_) => "taskRemoved",
            Event::TaskStuck(_) => "taskStuck",
        }
    }
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Synchronous, in-registration-order fan-out of lifecycle events.
///
/// Listeners for a given name are stored behind a `RwLock<Vec<Listener>>`
/// and emission clones the vector before iterating (copy-on-write, per
/// spec.md §9) so a listener that re-subscribes during its own invocation
/// never deadlocks the registry lock. A listener that panics is caught and
/// does not abort emission to the remaining subscribers.
#[derive(Default)]
pub struct EventChannel {
    added: RwLock<Vec<Listener>>,
    started: RwLock<Vec<Listener>>,
    completed: RwLock<Vec<Listener>>,
    failed: RwLock<Vec<Listener>>,
    retried: RwLock<Vec<Listener>>,
    removed: RwLock<Vec<Listener>>,
    stuck: RwLock<Vec<Listener>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    TaskAdded,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetried,
    TaskRemoved,
    TaskStuck,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: EventName) -> &RwLock<Vec<Listener>> {
        match name {
            EventName::TaskAdded => &self.added,
            EventName::TaskStarted => &self.started,
            EventName::TaskCompleted => &self.completed,
            EventName::TaskFailed => &self.failed,
            EventName::TaskRetried => &self.retried,
            EventName::TaskRemoved => &self.removed,
            EventName::TaskStuck => &self.stuck,
        }
    }

    /// Register a listener for a named event. Registration is append-only;
    /// there is no unsubscribe in the language-neutral contract.
    pub fn on(&self, name: EventName, listener: Listener) {
        self.slot(name)
            .write()
            .expect("poisoned EventChannel lock")
            .push(listener);
    }

    /// Emit an event to every listener registered for its name, in
    /// registration order. A listener panic is caught so it cannot corrupt
    /// engine state or abort emission to the rest of the subscribers.
    pub fn emit(&self, event: Event) {
        let name = match &event {
            Event::TaskAdded(_) => EventName::TaskAdded,
            Event::TaskStarted(_) => EventName::TaskStarted,
            Event::TaskCompleted(_) => EventName::TaskCompleted,
            Event::TaskFailed(_, _) => EventName::TaskFailed,
            Event::TaskRetried(_) => EventName::TaskRetried,
            Event::TaskRemoved(_) => EventName::TaskRemoved,
            Event::TaskStuck(_) => EventName::TaskStuck,
        };

        let listeners: Vec<Listener> = self
            .slot(name)
            .read()
            .expect("poisoned EventChannel lock")
            .clone();

        for listener in listeners {
            let event = event.clone();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(&event))).is_err()
            {
                tracing::warn!(event = event.name(), "event listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn sample_task() -> Task {
        use crate::task::TaskStatus;
        Task {
            id: Uuid::now_v7(),
            handler: "noop".into(),
            payload: serde_json::json!({}),
            status: TaskStatus::Pending,
            priority: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            max_retries: 3,
            max_processing_time: Duration::from_secs(600),
            retry_count: 0,
            log: None,
            reclaim_count: 0,
        }
    }

    #[test]
    fn emits_in_registration_order() {
        let channel = EventChannel::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        channel.on(EventName::TaskAdded, Arc::new(move |_| o1.lock().unwrap().push(1)));
        let o2 = order.clone();
        channel.on(EventName::TaskAdded, Arc::new(move |_| o2.lock().unwrap().push(2)));

        channel.emit(Event::TaskAdded(sample_task()));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn a_panicking_listener_does_not_stop_the_others() {
        let channel = EventChannel::new();
        let hits = Arc::new(AtomicUsize::new(0));

        channel.on(EventName::TaskFailed, Arc::new(|_| panic!("boom")));
        let h = hits.clone();
        channel.on(EventName::TaskFailed, Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        channel.emit(Event::TaskFailed(sample_task(), "boom".to_string()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
