//! `ShardConsumer`: the opaque per-shard consumer lifecycle handle. Record
//! delivery and the consumer's internal state machine live outside this
//! crate; the Scheduler only ever calls `request_shutdown` and
//! `is_shutdown_complete`.

/// The per-shard consumer's lifecycle state. The Scheduler never inspects
/// this directly — it is exposed so implementations and tests have a common
/// vocabulary for the state machine driving `request_shutdown` /
/// `is_shutdown_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Waiting,
    Initializing,
    Processing,
    Blocked,
    Ending,
    Shutdown,
}

/// An opaque handle to a running per-shard consumer. The Scheduler interacts
/// with it only through this trait: it does not know (or care) how records
/// are delivered or checkpoints are persisted.
pub trait ShardConsumer: Send + Sync {
    /// Idempotently requests that this consumer begin shutting down.
    /// Safe to call multiple times and from any owning task.
    fn request_shutdown(&self);

    /// Whether this consumer's shutdown has fully completed (it is safe to
    /// drop and remove from the registry).
    fn is_shutdown_complete(&self) -> bool;

    /// Current lifecycle state, for observability and tests.
    fn state(&self) -> ConsumerState;
}
