//! Recognized configuration options, with documented defaults. CLI parsing
//! and credential plumbing are explicit external collaborators and live outside
//! this crate; this is the config *type* the coordinator is built from.

use std::time::Duration;

/// Configuration for a single worker's `Scheduler` and background managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Logical worker identity, used for leader-election queries and logging.
    pub application_name: String,
    /// Scheduler loop period between process-loop ticks.
    pub parent_shard_poll_interval: Duration,
    /// Bounds `Scheduler::initialize`'s shard-sync retry loop.
    pub max_initialization_attempts: u32,
    /// Cadence gate for `LeaseCleanupManager`'s completed-lease reaping.
    pub completed_lease_cleanup_interval: Duration,
    /// Cadence gate for `LeaseCleanupManager`'s garbage-lease reaping.
    pub garbage_lease_cleanup_interval: Duration,
    /// Tick interval of the `LeaseCleanupManager`'s scheduled task.
    pub lease_cleanup_interval: Duration,
    /// How long a stream may be absent from the tracker before its lifecycle
    /// is torn down.
    pub old_stream_deferred_deletion_period: Duration,
    /// Gates whether completed-shard reaping runs at all.
    pub cleanup_leases_upon_shard_completion: bool,
    /// Upper bound on any single `StreamSource` RPC made by the cleanup
    /// manager or the sync manager.
    pub max_future_wait: Duration,
    /// `PeriodicShardSyncManager` tick period.
    pub periodic_shard_sync_interval: Duration,
    /// `PeriodicShardSyncManager` delay before its first tick.
    pub initial_delay: Duration,
}

impl CoordinatorConfig {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Self::default()
        }
    }

    /// Validates cross-field constraints that a malformed config could
    /// otherwise violate silently (e.g. a zero retry bound would make
    /// initialization unconditionally fatal).
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.trim().is_empty() {
            return Err("application_name must not be empty".to_string());
        }
        if self.max_initialization_attempts == 0 {
            return Err("max_initialization_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn with_parent_shard_poll_interval(mut self, interval: Duration) -> Self {
        self.parent_shard_poll_interval = interval;
        self
    }

    pub fn with_max_initialization_attempts(mut self, attempts: u32) -> Self {
        self.max_initialization_attempts = attempts;
        self
    }

    pub fn with_old_stream_deferred_deletion_period(mut self, period: Duration) -> Self {
        self.old_stream_deferred_deletion_period = period;
        self
    }

    pub fn with_cleanup_leases_upon_shard_completion(mut self, enabled: bool) -> Self {
        self.cleanup_leases_upon_shard_completion = enabled;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            application_name: "shard-coordinator".to_string(),
            parent_shard_poll_interval: Duration::from_secs(10),
            max_initialization_attempts: 20,
            completed_lease_cleanup_interval: Duration::from_secs(60),
            garbage_lease_cleanup_interval: Duration::from_secs(30),
            lease_cleanup_interval: Duration::from_secs(10),
            old_stream_deferred_deletion_period: Duration::from_secs(10 * 60),
            cleanup_leases_upon_shard_completion: true,
            max_future_wait: Duration::from_secs(5),
            periodic_shard_sync_interval: Duration::from_secs(300),
            initial_delay: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.max_initialization_attempts, 20);
        assert_eq!(cfg.initial_delay, Duration::from_secs(60));
        assert_eq!(cfg.periodic_shard_sync_interval, Duration::from_secs(300));
    }

    #[test]
    fn rejects_zero_retry_bound() {
        let cfg = CoordinatorConfig::new("worker-1").with_max_initialization_attempts(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_application_name() {
        let cfg = CoordinatorConfig::new("   ");
        assert!(cfg.validate().is_err());
    }
}
