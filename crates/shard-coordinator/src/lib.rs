//! A per-worker control plane for consuming a partitioned, append-only,
//! shard-structured event stream across a fleet of cooperating workers.
//!
//! Three subsystems do the work: [`scheduler::Scheduler`] diffs assigned
//! shards against live consumers, [`shard_sync::PeriodicShardSyncManager`]
//! discovers new shards and writes leases, and
//! [`cleanup::LeaseCleanupManager`] reaps leases of completed or vanished
//! shards. All three are built against external traits in [`interfaces`] —
//! this crate owns none of the stream transport, lease storage, leader
//! election, or per-shard record delivery.

pub mod async_errors;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod interfaces;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod shard_sync;
pub mod worker_state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::CoordinatorConfig;
pub use error::{AsyncError, CleanupError, SchedulerError, SourceError, StoreError, SyncError};
pub use scheduler::{Scheduler, SchedulerMetrics, StreamConfigTracker};
pub use worker_state::{WorkerState, WorkerStateChangeListener};
