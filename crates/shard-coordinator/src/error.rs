//! Per-module typed errors, grounded on `journal-client`'s `#[from]`-chained
//! `thiserror` enums (`read::Error`, `fragments::Error`) rather than a single
//! catch-all error type.

use crate::model::{ShardId, StreamIdentifier};

/// Errors surfaced by a `StreamSource` implementation.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("stream {0} not found")]
    ResourceNotFound(StreamIdentifier),

    #[error("shard {shard_id} of stream {stream} not found")]
    ShardNotFound {
        stream: StreamIdentifier,
        shard_id: ShardId,
    },

    #[error("source request timed out")]
    Timeout,

    #[error("source throttled the request (provisioned throughput exceeded)")]
    Throttled,

    #[error("transient dependency error: {0}")]
    Dependency(String),
}

impl SourceError {
    pub fn is_resource_not_found(&self) -> bool {
        matches!(
            self,
            SourceError::ResourceNotFound(_) | SourceError::ShardNotFound { .. }
        )
    }

    /// Dependency-class errors are retried by callers up to a bound; all
    /// other variants are treated as immediately fatal to the retrying unit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::Timeout | SourceError::Throttled | SourceError::Dependency(_)
        )
    }
}

/// Errors surfaced by a `LeaseStore` implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("lease {0} not found")]
    LeaseNotFound(String),

    #[error("lease {0} already exists")]
    LeaseAlreadyExists(String),

    #[error("conditional update of lease {lease_key} failed: expected counter {expected}")]
    ConcurrentModification { lease_key: String, expected: u64 },

    #[error("lease store contract violation: {0}")]
    InvalidState(String),

    #[error("transient dependency error: {0}")]
    Dependency(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Dependency(_))
    }
}

/// Errors surfaced while reaping a lease in `LeaseCleanupManager`.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A lineage invariant was violated: a child lease referenced by
    /// `child_shard_ids` does not exist. This is the typed stand-in for the
    /// upstream `IllegalStateException`; it is surfaced to the caller rather
    /// than panicking so the cleanup task can log and keep running.
    #[error("invariant violation: child lease {0} referenced but missing")]
    InvariantViolation(String),
}

/// Errors surfaced by `PeriodicShardSyncManager` / `ShardSyncTaskManager`.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the `Scheduler`.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("initial shard sync failed for {remaining} stream(s) after {attempts} attempts: {source}")]
    InitializationFailed {
        attempts: u32,
        remaining: usize,
        #[source]
        source: SyncError,
    },

    #[error("lease coordinator failed to initialize: {0}")]
    LeaseCoordinatorInitFailed(String),

    #[error("scheduler was already shut down")]
    AlreadyShutDown,

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// A classified, never-fatal error observed by the async error sink.
#[derive(Debug, thiserror::Error)]
pub enum AsyncError {
    #[error("task rejected by executor: {reason}")]
    RejectedTask { reason: String },

    #[error("undeliverable async error: {0}")]
    Other(String),
}
