//! `ShardSyncTaskManager` and `PeriodicShardSyncManager`: leader-only periodic
//! shard discovery, synchronized into the shared lease table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, SyncError};
use crate::interfaces::{LeaderDecider, LeaseStore, StreamSource};
use crate::model::{Lease, StreamConfig, StreamIdentifier};

/// Constructs a `ShardSyncTaskManager` for a given stream. An indirection
/// point rather than a constructor the Scheduler calls directly, so tests can
/// substitute a manager with different internals.
pub type ShardSyncTaskManagerFactory = Arc<dyn Fn(StreamConfig) -> ShardSyncTaskManager + Send + Sync>;

/// Discovers shards of a single stream and synchronizes new leases into the
/// `LeaseStore`. One instance per declared stream, cached by the owning
/// `Scheduler`/`PeriodicShardSyncManager`.
pub struct ShardSyncTaskManager {
    pub stream_config: StreamConfig,
    running: AtomicBool,
}

impl ShardSyncTaskManager {
    pub fn new(stream_config: StreamConfig) -> Self {
        Self {
            stream_config,
            running: AtomicBool::new(false),
        }
    }

    /// Non-blocking dispatch guard: returns `true` and marks the manager busy
    /// iff no sync for this stream is currently in flight.
    pub fn try_begin(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Lists shards from the source and creates any lease that does not yet
    /// exist, seeded at the stream's configured initial position. Lease
    /// creation is idempotent: `LeaseAlreadyExists` from a concurrent sync is
    /// swallowed. Returns the number of leases newly created.
    pub async fn execute_shard_sync_task(
        &self,
        source: &dyn StreamSource,
        lease_store: &dyn LeaseStore,
    ) -> Result<usize, SyncError> {
        let stream_identifier = &self.stream_config.stream_identifier;
        let shards = source.list_shards(stream_identifier).await?;
        let existing: std::collections::HashSet<String> = lease_store
            .list_leases()
            .await?
            .into_iter()
            .map(|l| l.lease_key)
            .collect();

        let mut created = 0usize;
        for shard in shards {
            let lease = Lease::new(
                shard.shard_id.clone(),
                Some(stream_identifier.clone()),
                self.stream_config.initial_position.initial_checkpoint(),
            )
            .with_parents(shard.parent_shard_ids.clone());

            if existing.contains(&lease.lease_key) {
                continue;
            }

            match lease_store.create_lease_if_not_exists(lease).await {
                Ok(()) => created += 1,
                Err(StoreError::LeaseAlreadyExists(_)) => {}
                Err(other) => return Err(other.into()),
            }
        }

        Ok(created)
    }
}

/// The leader-elected background task that drives shard discovery across
/// every declared stream.
pub struct PeriodicShardSyncManager {
    worker_id: String,
    source: Arc<dyn StreamSource>,
    lease_store: Arc<dyn LeaseStore>,
    leader_decider: Arc<dyn LeaderDecider>,
    task_managers: Mutex<HashMap<StreamIdentifier, Arc<ShardSyncTaskManager>>>,
    is_running: AtomicBool,
    cancel: CancellationToken,
}

/// Outcome of dispatching a single stream's sync during a `tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A sync was dispatched (non-blocking) for this stream.
    Dispatched,
    /// Skipped: a sync for this stream was already in flight.
    SkippedAlreadyRunning,
}

impl PeriodicShardSyncManager {
    pub fn new(
        worker_id: impl Into<String>,
        source: Arc<dyn StreamSource>,
        lease_store: Arc<dyn LeaseStore>,
        leader_decider: Arc<dyn LeaderDecider>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            source,
            lease_store,
            leader_decider,
            task_managers: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn task_manager_for(&self, stream_config: &StreamConfig) -> Arc<ShardSyncTaskManager> {
        let mut managers = self.task_managers.lock().unwrap();
        managers
            .entry(stream_config.stream_identifier.clone())
            .or_insert_with(|| Arc::new(ShardSyncTaskManager::new(stream_config.clone())))
            .clone()
    }

    /// The synchronous variant used during `Scheduler::initialize`: awaits
    /// each stream's sync directly and propagates the first error.
    pub async fn sync_shards_once(&self, streams: &[StreamConfig]) -> Result<(), SyncError> {
        for stream_config in streams {
            let manager = self.task_manager_for(stream_config);
            manager
                .execute_shard_sync_task(self.source.as_ref(), self.lease_store.as_ref())
                .await?;
        }
        Ok(())
    }

    /// Like `sync_shards_once`, but runs every stream's sync independently
    /// and reports a per-stream result instead of stopping at the first
    /// error. Used by the Scheduler's initialization retry loop, where a
    /// failing stream must not block progress on the others.
    pub async fn sync_shards_each(&self, streams: &[StreamConfig]) -> Vec<(StreamIdentifier, Result<usize, SyncError>)> {
        let mut results = Vec::with_capacity(streams.len());
        for stream_config in streams {
            let manager = self.task_manager_for(stream_config);
            let result = manager
                .execute_shard_sync_task(self.source.as_ref(), self.lease_store.as_ref())
                .await;
            results.push((stream_config.stream_identifier.clone(), result));
        }
        results
    }

    /// One periodic tick. No-ops (debug-logged) if this worker is not the
    /// leader. For each declared stream, dispatches a non-blocking sync,
    /// skipping (with a warning) any stream whose previous sync is still
    /// running. Exceptions from a dispatched sync are logged and swallowed —
    /// they never propagate out of `tick`.
    pub async fn tick(&self, streams: &[StreamConfig]) -> Vec<(StreamIdentifier, DispatchOutcome)> {
        if !self.leader_decider.is_leader(&self.worker_id).await {
            tracing::debug!(worker_id = %self.worker_id, "not leader, skipping periodic shard sync");
            return Vec::new();
        }

        // Informational only: log how many known leases exist per tracked
        // stream.
        if let Ok(leases) = self.lease_store.list_leases().await {
            let tracked: std::collections::HashSet<&StreamIdentifier> =
                streams.iter().map(|s| &s.stream_identifier).collect();
            let mut per_stream: HashMap<StreamIdentifier, usize> = HashMap::new();
            for lease in &leases {
                if let Some(stream) = &lease.stream_identifier {
                    if tracked.contains(stream) {
                        *per_stream.entry(stream.clone()).or_insert(0) += 1;
                    }
                }
            }
            tracing::debug!(?per_stream, "observed leases per tracked stream");
        }

        let mut outcomes = Vec::with_capacity(streams.len());
        for stream_config in streams {
            let manager = self.task_manager_for(stream_config);
            if !manager.try_begin() {
                tracing::warn!(
                    stream = %stream_config.stream_identifier,
                    "previous shard sync still running, skipping this tick"
                );
                outcomes.push((stream_config.stream_identifier.clone(), DispatchOutcome::SkippedAlreadyRunning));
                continue;
            }

            let source = self.source.clone();
            let lease_store = self.lease_store.clone();
            let manager = manager.clone();
            let stream_id = stream_config.stream_identifier.clone();
            tokio::spawn(async move {
                let result = manager
                    .execute_shard_sync_task(source.as_ref(), lease_store.as_ref())
                    .await;
                if let Err(err) = result {
                    tracing::error!(stream = %stream_id, error = %err, "periodic shard sync failed");
                }
                manager.finish();
            });
            outcomes.push((stream_config.stream_identifier.clone(), DispatchOutcome::Dispatched));
        }
        outcomes
    }

    /// Whether the union of observed shards covers the full hash range.
    ///
    /// TODO: the intended predicate (every point of the partition key space
    /// is covered by exactly one open shard) needs a merge/split-aware range
    /// model that doesn't exist yet; stubbed as an extension point.
    pub fn is_hash_range_complete(&self, _stream_identifier: &StreamIdentifier) -> bool {
        false
    }

    /// Starts the periodic background task. Uses fixed-delay semantics: the
    /// next tick is scheduled `period` after the previous tick *returns*, so
    /// a slow tick never overlaps its successor. Note: if `initial_delay` is
    /// shorter than `Scheduler::initialize`'s own synchronous shard sync,
    /// the first periodic tick can race the init-time sync; both paths are
    /// idempotent against the lease store, so the race is harmless.
    pub fn start(
        self: &Arc<Self>,
        streams_provider: impl Fn() -> Vec<StreamConfig> + Send + Sync + 'static,
        initial_delay: std::time::Duration,
        period: std::time::Duration,
    ) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            loop {
                let streams = streams_provider();
                this.tick(&streams).await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        });
    }

    /// Stops the background task. Mutually exclusive with `start`; a
    /// subsequent `start` after `stop` is allowed (unlike the Scheduler,
    /// which treats post-shutdown `start` as a contract violation).
    pub fn stop(&self) {
        self.cancel.cancel();
        self.is_running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::ShardDescriptor;
    use crate::model::{InitialPosition, SequencePosition, ShardId};
    use crate::testing::{FakeLeaderDecider, InMemoryLeaseStore, ScriptedStreamSource};

    fn stream(name: &str) -> StreamIdentifier {
        StreamIdentifier::single(name)
    }

    #[tokio::test]
    async fn execute_shard_sync_task_creates_missing_leases_idempotently() {
        let source = ScriptedStreamSource::new().with_shards(
            stream("orders"),
            vec![
                ShardDescriptor {
                    shard_id: ShardId::from("shard-0"),
                    parent_shard_ids: Vec::new(),
                },
                ShardDescriptor {
                    shard_id: ShardId::from("shard-1"),
                    parent_shard_ids: vec![ShardId::from("shard-0")],
                },
            ],
        );
        let lease_store = InMemoryLeaseStore::new();
        let manager = ShardSyncTaskManager::new(StreamConfig::new(stream("orders"), InitialPosition::TrimHorizon));

        let created = manager.execute_shard_sync_task(&source, &lease_store).await.unwrap();
        assert_eq!(created, 2);

        // Running again is a no-op: both leases already exist.
        let created_again = manager.execute_shard_sync_task(&source, &lease_store).await.unwrap();
        assert_eq!(created_again, 0);

        let leases = lease_store.list_leases().await.unwrap();
        assert_eq!(leases.len(), 2);
        let child = leases.iter().find(|l| l.shard_id == ShardId::from("shard-1")).unwrap();
        assert_eq!(child.parent_shard_ids, vec![ShardId::from("shard-0")]);
        assert_eq!(child.checkpoint, SequencePosition::TrimHorizon);
    }

    #[tokio::test]
    async fn tick_is_a_noop_when_not_leader() {
        let source = Arc::new(ScriptedStreamSource::new());
        let lease_store = Arc::new(InMemoryLeaseStore::new());
        let leader_decider = Arc::new(FakeLeaderDecider::follower());
        let manager = PeriodicShardSyncManager::new("worker-1", source, lease_store, leader_decider);

        let outcomes = manager
            .tick(&[StreamConfig::new(stream("orders"), InitialPosition::Latest)])
            .await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn tick_skips_stream_with_sync_already_in_flight() {
        let source = Arc::new(ScriptedStreamSource::new());
        let lease_store = Arc::new(InMemoryLeaseStore::new());
        let leader_decider = Arc::new(FakeLeaderDecider::leader());
        let manager = PeriodicShardSyncManager::new("worker-1", source, lease_store, leader_decider);
        let stream_config = StreamConfig::new(stream("orders"), InitialPosition::Latest);

        let busy_manager = manager.task_manager_for(&stream_config);
        assert!(busy_manager.try_begin());

        let outcomes = manager.tick(&[stream_config]).await;
        assert_eq!(outcomes, vec![(stream("orders"), DispatchOutcome::SkippedAlreadyRunning)]);
    }
}
