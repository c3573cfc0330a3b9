//! Worker lifecycle state and its change-notification trait. The
//! `CREATED → INITIALIZING → INITIALIZED → STARTED → SHUT_DOWN_STARTED →
//! SHUT_DOWN` transition sequence is made an explicit small state machine so
//! an illegal transition is caught at debug time rather than silently logged.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Created,
    Initializing,
    Initialized,
    Started,
    ShutDownStarted,
    ShutDown,
}

impl WorkerState {
    /// The only transitions the Scheduler's lifecycle ever makes.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Created, Initializing)
                | (Initializing, Initialized)
                | (Initialized, Started)
                | (Started, ShutDownStarted)
                | (ShutDownStarted, ShutDown)
        )
    }
}

/// Notified of every `WorkerState` transition the Scheduler makes.
pub trait WorkerStateChangeListener: Send + Sync {
    fn on_worker_state_change(&self, state: WorkerState);
}

/// A `WorkerStateChangeListener` that does nothing, for callers that don't
/// need to observe transitions.
pub struct NoopWorkerStateChangeListener;

impl WorkerStateChangeListener for NoopWorkerStateChangeListener {
    fn on_worker_state_change(&self, _state: WorkerState) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_documented_transitions_are_legal() {
        assert!(WorkerState::Created.can_transition_to(WorkerState::Initializing));
        assert!(WorkerState::Initializing.can_transition_to(WorkerState::Initialized));
        assert!(WorkerState::Initialized.can_transition_to(WorkerState::Started));
        assert!(WorkerState::Started.can_transition_to(WorkerState::ShutDownStarted));
        assert!(WorkerState::ShutDownStarted.can_transition_to(WorkerState::ShutDown));

        assert!(!WorkerState::Created.can_transition_to(WorkerState::Started));
        assert!(!WorkerState::ShutDown.can_transition_to(WorkerState::Created));
        assert!(!WorkerState::Initialized.can_transition_to(WorkerState::Initializing));
    }
}
