//! The async error classifier: installed once during `Scheduler::initialize`,
//! it turns undeliverable async errors into either a logged-and-dropped event
//! or a diagnostic `RejectedTaskEvent`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AsyncError;

/// A snapshot of the executor's load at the moment a task was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutorStateEvent {
    pub pool_size: usize,
    pub active_count: usize,
    pub queue_depth: usize,
}

/// Diagnostic event dispatched when the executor rejects a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedTaskEvent {
    pub executor_state: ExecutorStateEvent,
    pub reason: String,
}

/// Receives `RejectedTaskEvent`s. Implementations typically log and/or
/// forward to a metrics sink; this crate does not depend on one.
pub trait RejectedTaskHandler: Send + Sync {
    fn handle(&self, event: RejectedTaskEvent);
}

/// Logs the event at warn level. The default handler when none is supplied.
pub struct LoggingRejectedTaskHandler;

impl RejectedTaskHandler for LoggingRejectedTaskHandler {
    fn handle(&self, event: RejectedTaskEvent) {
        tracing::warn!(
            reason = %event.reason,
            pool_size = event.executor_state.pool_size,
            active_count = event.executor_state.active_count,
            queue_depth = event.executor_state.queue_depth,
            "task rejected by executor"
        );
    }
}

/// Classifies undeliverable async errors observed anywhere in the
/// coordinator and dispatches `RejectedTaskEvent`s for the rejected-task
/// class, logging and dropping everything else.
pub struct AsyncErrorClassifier<H: RejectedTaskHandler> {
    handler: H,
    executor_state: Box<dyn Fn() -> ExecutorStateEvent + Send + Sync>,
    rejected_task_count: AtomicU64,
}

impl<H: RejectedTaskHandler> AsyncErrorClassifier<H> {
    pub fn new(handler: H, executor_state: impl Fn() -> ExecutorStateEvent + Send + Sync + 'static) -> Self {
        Self {
            handler,
            executor_state: Box::new(executor_state),
            rejected_task_count: AtomicU64::new(0),
        }
    }

    /// Classifies and handles a single undeliverable error. Returns the
    /// dispatched event, if any, purely for testability.
    pub fn classify(&self, error: &AsyncError) -> Option<RejectedTaskEvent> {
        match error {
            AsyncError::RejectedTask { reason } => {
                let event = RejectedTaskEvent {
                    executor_state: (self.executor_state)(),
                    reason: reason.clone(),
                };
                self.rejected_task_count.fetch_add(1, Ordering::Relaxed);
                self.handler.handle(event.clone());
                Some(event)
            }
            AsyncError::Other(reason) => {
                tracing::warn!(%reason, "undeliverable async error");
                None
            }
        }
    }

    pub fn rejected_task_count(&self) -> u64 {
        self.rejected_task_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingHandler(Arc<Mutex<Vec<RejectedTaskEvent>>>);

    impl RejectedTaskHandler for RecordingHandler {
        fn handle(&self, event: RejectedTaskEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn rejected_task_dispatches_exactly_one_event_with_executor_state() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let classifier = AsyncErrorClassifier::new(RecordingHandler(events.clone()), || {
            ExecutorStateEvent {
                pool_size: 4,
                active_count: 4,
                queue_depth: 10,
            }
        });

        let dispatched = classifier.classify(&AsyncError::RejectedTask {
            reason: "queue full".to_string(),
        });

        assert!(dispatched.is_some());
        assert_eq!(events.lock().unwrap().len(), 1);
        assert_eq!(events.lock().unwrap()[0].executor_state.queue_depth, 10);
        assert_eq!(classifier.rejected_task_count(), 1);
    }

    #[test]
    fn other_errors_are_logged_and_dropped() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let classifier = AsyncErrorClassifier::new(RecordingHandler(events.clone()), {
            ExecutorStateEvent::default
        });

        let dispatched = classifier.classify(&AsyncError::Other("transient".to_string()));

        assert!(dispatched.is_none());
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(classifier.rejected_task_count(), 0);
    }
}
