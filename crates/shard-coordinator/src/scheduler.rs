//! `Scheduler`: the worker-local control loop. Owns initialization, the
//! per-tick assignment diff, multi-stream lifecycle reconciliation, and
//! shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::async_errors::{AsyncErrorClassifier, ExecutorStateEvent, LoggingRejectedTaskHandler};
use crate::cleanup::LeaseCleanupManager;
use crate::config::CoordinatorConfig;
use crate::error::{AsyncError, SchedulerError, StoreError, SyncError};
use crate::interfaces::{LeaderDecider, LeaseStore, ShardConsumer, StreamSource};
use crate::model::{Lease, LeaseUpdateField, StreamConfig, StreamIdentifier};
use crate::registry::ShardConsumerRegistry;
use crate::shard_sync::PeriodicShardSyncManager;
use crate::worker_state::{NoopWorkerStateChangeListener, WorkerState, WorkerStateChangeListener};

/// Supplies the declared set of streams in multi-stream mode. A single-stream
/// deployment never constructs one of these; its one `StreamConfig` is fixed
/// at `Scheduler` construction.
pub trait StreamConfigTracker: Send + Sync {
    fn stream_configs(&self) -> Vec<StreamConfig>;
}

enum StreamMode {
    Single(StreamConfig),
    Multi(Arc<dyn StreamConfigTracker>),
}

/// Lightweight in-process counters standing in for a metrics sink this crate
/// doesn't depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerMetrics {
    pub consumers_built: u64,
    pub streams_synced_new: u64,
    pub streams_expired: u64,
}

#[derive(Default)]
struct AtomicSchedulerMetrics {
    consumers_built: AtomicU64,
    streams_synced_new: AtomicU64,
    streams_expired: AtomicU64,
}

/// The worker-local control loop tying the registry and the two background
/// managers to a single source of truth: the `LeaseStore`.
pub struct Scheduler<C: ShardConsumer> {
    worker_id: String,
    config: CoordinatorConfig,
    mode: StreamMode,
    lease_store: Arc<dyn LeaseStore>,
    source: Arc<dyn StreamSource>,
    leader_decider: Arc<dyn LeaderDecider>,
    registry: ShardConsumerRegistry<C>,
    consumer_factory: Box<dyn Fn(&crate::model::ShardInfo) -> C + Send + Sync>,
    sync_manager: Arc<PeriodicShardSyncManager>,
    cleanup_manager: Arc<LeaseCleanupManager>,
    async_classifier: AsyncErrorClassifier<LoggingRejectedTaskHandler>,
    state_listener: Arc<dyn WorkerStateChangeListener>,
    worker_state: Mutex<WorkerState>,
    current_stream_config_map: Arc<Mutex<HashMap<StreamIdentifier, StreamConfig>>>,
    stale_stream_deletion_map: Mutex<HashMap<StreamIdentifier, Instant>>,
    metrics: AtomicSchedulerMetrics,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl<C: ShardConsumer + 'static> Scheduler<C> {
    /// Constructs a single-stream Scheduler.
    #[allow(clippy::too_many_arguments)]
    pub fn new_single_stream(
        config: CoordinatorConfig,
        stream_config: StreamConfig,
        source: Arc<dyn StreamSource>,
        lease_store: Arc<dyn LeaseStore>,
        leader_decider: Arc<dyn LeaderDecider>,
        consumer_factory: impl Fn(&crate::model::ShardInfo) -> C + Send + Sync + 'static,
    ) -> Self {
        Self::new(
            config,
            StreamMode::Single(stream_config),
            source,
            lease_store,
            leader_decider,
            consumer_factory,
            Arc::new(NoopWorkerStateChangeListener),
        )
    }

    /// Constructs a multi-stream Scheduler backed by a `StreamConfigTracker`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_multi_stream(
        config: CoordinatorConfig,
        tracker: Arc<dyn StreamConfigTracker>,
        source: Arc<dyn StreamSource>,
        lease_store: Arc<dyn LeaseStore>,
        leader_decider: Arc<dyn LeaderDecider>,
        consumer_factory: impl Fn(&crate::model::ShardInfo) -> C + Send + Sync + 'static,
    ) -> Self {
        Self::new(
            config,
            StreamMode::Multi(tracker),
            source,
            lease_store,
            leader_decider,
            consumer_factory,
            Arc::new(NoopWorkerStateChangeListener),
        )
    }

    pub fn with_state_listener(mut self, listener: Arc<dyn WorkerStateChangeListener>) -> Self {
        self.state_listener = listener;
        self
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        config: CoordinatorConfig,
        mode: StreamMode,
        source: Arc<dyn StreamSource>,
        lease_store: Arc<dyn LeaseStore>,
        leader_decider: Arc<dyn LeaderDecider>,
        consumer_factory: impl Fn(&crate::model::ShardInfo) -> C + Send + Sync + 'static,
        state_listener: Arc<dyn WorkerStateChangeListener>,
    ) -> Self {
        let worker_id = config.application_name.clone();
        let default_stream_identifier = match &mode {
            StreamMode::Single(cfg) => Some(cfg.stream_identifier.clone()),
            StreamMode::Multi(_) => None,
        };
        let sync_manager = Arc::new(PeriodicShardSyncManager::new(
            worker_id.clone(),
            source.clone(),
            lease_store.clone(),
            leader_decider.clone(),
        ));
        let cleanup_manager = Arc::new(LeaseCleanupManager::new(
            lease_store.clone(),
            source.clone(),
            config.cleanup_leases_upon_shard_completion,
            config.completed_lease_cleanup_interval,
            config.garbage_lease_cleanup_interval,
            config.max_future_wait,
            default_stream_identifier,
        ));

        Self {
            worker_id,
            config,
            mode,
            lease_store,
            source,
            leader_decider,
            registry: ShardConsumerRegistry::new(),
            consumer_factory: Box::new(consumer_factory),
            sync_manager,
            cleanup_manager,
            async_classifier: AsyncErrorClassifier::new(LoggingRejectedTaskHandler, || ExecutorStateEvent::default()),
            state_listener,
            worker_state: Mutex::new(WorkerState::Created),
            current_stream_config_map: Arc::new(Mutex::new(HashMap::new())),
            stale_stream_deletion_map: Mutex::new(HashMap::new()),
            metrics: AtomicSchedulerMetrics::default(),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            consumers_built: self.metrics.consumers_built.load(Ordering::Relaxed),
            streams_synced_new: self.metrics.streams_synced_new.load(Ordering::Relaxed),
            streams_expired: self.metrics.streams_expired.load(Ordering::Relaxed),
        }
    }

    pub fn worker_state(&self) -> WorkerState {
        *self.worker_state.lock().unwrap()
    }

    pub fn registry(&self) -> &ShardConsumerRegistry<C> {
        &self.registry
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Reports an undeliverable async error to the installed classifier.
    /// Exposed so a host framework driving per-shard consumers can route its
    /// own rejected-task errors through the same sink the Scheduler installs
    /// at `initialize`.
    pub fn report_async_error(&self, error: &AsyncError) {
        self.async_classifier.classify(error);
    }

    pub fn rejected_task_count(&self) -> u64 {
        self.async_classifier.rejected_task_count()
    }

    fn publish_state(&self, next: WorkerState) {
        let mut current = self.worker_state.lock().unwrap();
        if !current.can_transition_to(next) {
            tracing::error!(from = ?*current, to = ?next, "illegal worker state transition suppressed");
            return;
        }
        *current = next;
        drop(current);
        self.state_listener.on_worker_state_change(next);
    }

    fn declared_stream_configs(&self) -> Vec<StreamConfig> {
        match &self.mode {
            StreamMode::Single(cfg) => vec![cfg.clone()],
            StreamMode::Multi(tracker) => tracker.stream_configs(),
        }
    }

    /// Phase 1 of `initialize`: bounded-retry initial shard sync across every
    /// declared stream. Streams that already succeeded drop out of the retry
    /// set on subsequent attempts.
    async fn sync_with_retries(&self, streams: Vec<StreamConfig>) -> Result<(), SchedulerError> {
        let mut remaining: HashMap<StreamIdentifier, StreamConfig> =
            streams.into_iter().map(|c| (c.stream_identifier.clone(), c)).collect();

        let mut last_error: Option<SyncError> = None;
        for attempt in 1..=self.config.max_initialization_attempts {
            if remaining.is_empty() {
                return Ok(());
            }
            let pending: Vec<StreamConfig> = remaining.values().cloned().collect();
            let results = self.sync_manager.sync_shards_each(&pending).await;
            for (stream_id, result) in results {
                match result {
                    Ok(_) => {
                        remaining.remove(&stream_id);
                    }
                    Err(err) => {
                        tracing::warn!(stream = %stream_id, attempt, error = %err, "initial shard sync failed, will retry");
                        last_error = Some(err);
                    }
                }
            }
            if remaining.is_empty() {
                return Ok(());
            }
            if attempt < self.config.max_initialization_attempts {
                tokio::time::sleep(self.config.parent_shard_poll_interval).await;
            }
        }

        Err(SchedulerError::InitializationFailed {
            attempts: self.config.max_initialization_attempts,
            remaining: remaining.len(),
            source: last_error.unwrap_or(SyncError::Source(crate::error::SourceError::Timeout)),
        })
    }

    async fn initialize_lease_coordinator(&self) -> Result<(), SchedulerError> {
        self.lease_store
            .list_leases()
            .await
            .map(|_| ())
            .map_err(|err| SchedulerError::LeaseCoordinatorInitFailed(err.to_string()))
    }

    /// Releases every lease currently owned by this worker by clearing its
    /// `owner` field. Best-effort: a failure to release one lease is logged
    /// and does not abort the remainder.
    async fn release_owned_leases(&self) {
        let leases = match self.lease_store.list_leases().await {
            Ok(leases) => leases,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list leases during shutdown release");
                return;
            }
        };
        let releases = leases
            .into_iter()
            .filter(|l| l.owner.as_deref() == Some(self.worker_id.as_str()))
            .map(|lease| async move {
                let mut released = lease.clone();
                released.owner = None;
                let result = self
                    .lease_store
                    .update_lease_with_meta_info(&released, LeaseUpdateField::Owner)
                    .await;
                (lease.lease_key, result)
            });

        for (lease_key, result) in futures::future::join_all(releases).await {
            if let Err(err) = result {
                if !matches!(err, StoreError::ConcurrentModification { .. }) {
                    tracing::warn!(lease_key = %lease_key, error = %err, "failed to release owned lease");
                }
            }
        }
    }

    /// Brings the worker up: initializes the lease coordinator, syncs every
    /// declared stream's shards with retry, then starts the background sync
    /// and cleanup managers.
    pub async fn initialize(&self) -> Result<(), SchedulerError> {
        if self.is_shut_down() {
            return Err(SchedulerError::AlreadyShutDown);
        }

        self.publish_state(WorkerState::Initializing);

        self.initialize_lease_coordinator().await?;

        let declared = self.declared_stream_configs();
        {
            let mut current = self.current_stream_config_map.lock().unwrap();
            for cfg in &declared {
                current.insert(cfg.stream_identifier.clone(), cfg.clone());
            }
        }

        self.sync_with_retries(declared).await?;

        let streams_map = self.current_stream_config_map.clone();
        self.sync_manager.start(
            move || streams_map.lock().unwrap().values().cloned().collect(),
            self.config.initial_delay,
            self.config.periodic_shard_sync_interval,
        );
        self.cleanup_manager.start(self.config.lease_cleanup_interval);

        self.publish_state(WorkerState::Initialized);
        self.publish_state(WorkerState::Started);
        Ok(())
    }

    /// One iteration of the worker's process loop: diffs this worker's owned
    /// leases against its built consumers, builds the missing ones, retires
    /// the absent ones, and (in multi-stream mode) reconciles stream
    /// lifecycle.
    pub async fn run_process_loop_once(&self) -> Result<(), SchedulerError> {
        let leases = self
            .lease_store
            .list_leases()
            .await
            .map_err(|err| SchedulerError::Sync(SyncError::Store(err)))?;

        let assignments: Vec<crate::model::ShardInfo> = leases
            .iter()
            .filter(|lease| lease.owner.as_deref() == Some(self.worker_id.as_str()))
            .map(Lease::to_shard_info)
            .collect();

        for shard_info in &assignments {
            if shard_info.checkpoint.is_shard_end() {
                continue;
            }
            let (_, built) = self
                .registry
                .create_or_get(shard_info, |info| (self.consumer_factory)(info));
            if built {
                self.metrics.consumers_built.fetch_add(1, Ordering::Relaxed);
                tracing::info!(shard_id = %shard_info.shard_id, "built consumer for newly assigned shard");
            }
        }

        self.registry.retire_absent(assignments.iter());
        self.registry.sweep_finished();

        if matches!(self.mode, StreamMode::Multi(_)) {
            if let Err(err) = self.check_and_sync_streams_and_leases().await {
                tracing::error!(error = %err, "multi-stream lifecycle reconciliation failed");
            }
        }

        Ok(())
    }

    /// Multi-stream lifecycle reconciliation: syncs newly declared streams
    /// and expires streams that have been absent from the tracker for longer
    /// than the deferment period. No-op in single-stream mode. Returns the
    /// number of streams synced this tick (new + expired).
    async fn check_and_sync_streams_and_leases(&self) -> Result<usize, SchedulerError> {
        let tracker = match &self.mode {
            StreamMode::Multi(tracker) => tracker.clone(),
            StreamMode::Single(_) => return Ok(0),
        };

        let declared: HashMap<StreamIdentifier, StreamConfig> = tracker
            .stream_configs()
            .into_iter()
            .map(|c| (c.stream_identifier.clone(), c))
            .collect();
        let declared_set: HashSet<StreamIdentifier> = declared.keys().cloned().collect();

        let now = Instant::now();
        let (known_set, to_expire) = {
            let current = self.current_stream_config_map.lock().unwrap();
            let mut stale = self.stale_stream_deletion_map.lock().unwrap();
            let known: HashSet<StreamIdentifier> = current.keys().cloned().collect();

            for id in known.iter() {
                if !declared_set.contains(id) && !stale.contains_key(id) {
                    stale.insert(id.clone(), now);
                }
            }
            for id in declared_set.iter() {
                stale.remove(id);
            }

            let expired: Vec<StreamIdentifier> = stale
                .iter()
                .filter(|(_, first_absent)| now.duration_since(**first_absent) >= self.config.old_stream_deferred_deletion_period)
                .map(|(id, _)| id.clone())
                .collect();

            (known, expired)
        };

        let new_streams: Vec<StreamIdentifier> = declared_set.difference(&known_set).cloned().collect();
        let mut synced = 0usize;

        for id in &new_streams {
            let cfg = declared[id].clone();
            {
                let mut current = self.current_stream_config_map.lock().unwrap();
                current.insert(id.clone(), cfg.clone());
            }
            match self.sync_manager.sync_shards_once(&[cfg]).await {
                Ok(()) => {
                    synced += 1;
                    self.metrics.streams_synced_new.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => tracing::warn!(stream = %id, error = %err, "sync of newly declared stream failed"),
            }
        }

        for id in &to_expire {
            let cfg = {
                let current = self.current_stream_config_map.lock().unwrap();
                current.get(id).cloned()
            };
            if let Some(cfg) = cfg {
                if let Err(err) = self.sync_manager.sync_shards_once(&[cfg]).await {
                    tracing::warn!(stream = %id, error = %err, "drain sync before stream expiry failed");
                }
            }
            {
                let mut current = self.current_stream_config_map.lock().unwrap();
                current.remove(id);
            }
            {
                let mut stale = self.stale_stream_deletion_map.lock().unwrap();
                stale.remove(id);
            }
            synced += 1;
            self.metrics.streams_expired.fetch_add(1, Ordering::Relaxed);
        }

        Ok(synced)
    }

    pub fn current_stream_identifiers(&self) -> HashSet<StreamIdentifier> {
        self.current_stream_config_map.lock().unwrap().keys().cloned().collect()
    }

    pub fn stale_stream_identifiers(&self) -> HashSet<StreamIdentifier> {
        self.stale_stream_deletion_map.lock().unwrap().keys().cloned().collect()
    }

    /// Runs `run_process_loop_once` on a fixed-delay cadence of
    /// `parent_shard_poll_interval` until cancelled by `shutdown`.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        if self.is_shut_down() {
            return Err(SchedulerError::AlreadyShutDown);
        }
        loop {
            if let Err(err) = self.run_process_loop_once().await {
                tracing::error!(error = %err, "process loop tick failed");
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.parent_shard_poll_interval) => {}
            }
        }
    }

    /// Tears the worker down: releases owned leases, stops the background
    /// managers, and waits for built consumers to finish. Idempotent: a
    /// second call observes `is_shut_down()` already true and returns
    /// immediately.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.publish_state(WorkerState::ShutDownStarted);

        self.release_owned_leases().await;
        self.leader_decider.shutdown().await;

        self.sync_manager.stop();
        self.cleanup_manager.stop();
        self.cancel.cancel();

        self.registry.retire_absent(std::iter::empty());
        let deadline = Instant::now() + self.config.max_future_wait * 4;
        while !self.registry.is_empty() && Instant::now() < deadline {
            self.registry.sweep_finished();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.registry.sweep_finished();
        if !self.registry.is_empty() {
            tracing::warn!(remaining = self.registry.len(), "shutdown proceeding with unfinished consumers");
        }

        self.publish_state(WorkerState::ShutDown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InitialPosition, SequencePosition, ShardId};
    use crate::testing::fakes::FakeShardConsumer;
    use crate::testing::{FakeLeaderDecider, InMemoryLeaseStore, ScriptedStreamSource};
    use std::sync::Mutex as StdMutex;

    fn single_stream_scheduler(
        source: Arc<ScriptedStreamSource>,
        lease_store: Arc<InMemoryLeaseStore>,
        stream: StreamIdentifier,
    ) -> Scheduler<FakeShardConsumer> {
        let config = CoordinatorConfig::new("worker-1").with_max_initialization_attempts(3);
        Scheduler::new_single_stream(
            config,
            StreamConfig::new(stream, InitialPosition::TrimHorizon),
            source,
            lease_store,
            Arc::new(FakeLeaderDecider::leader()),
            |_info| FakeShardConsumer::new(),
        )
    }

    struct ScriptedTracker {
        configs: StdMutex<Vec<StreamConfig>>,
    }

    impl ScriptedTracker {
        fn new(configs: Vec<StreamConfig>) -> Self {
            Self {
                configs: StdMutex::new(configs),
            }
        }

        fn set(&self, configs: Vec<StreamConfig>) {
            *self.configs.lock().unwrap() = configs;
        }
    }

    impl StreamConfigTracker for ScriptedTracker {
        fn stream_configs(&self) -> Vec<StreamConfig> {
            self.configs.lock().unwrap().clone()
        }
    }

    fn owned_lease(worker: &str, shard_id: &str, checkpoint: SequencePosition) -> Lease {
        Lease::new(ShardId::from(shard_id), None, checkpoint).with_owner(worker)
    }

    /// A consumer is built the first tick a shard's lease is observed, and
    /// never rebuilt on subsequent ticks even as the checkpoint advances via
    /// ordinary renewals, since identity is keyed by
    /// `(shard_id, concurrency_token)` and the `concurrency_token` is stable
    /// across renewals — it only changes on a new ownership epoch.
    #[tokio::test]
    async fn consumer_built_once_across_checkpoint_changing_ticks() {
        let source = Arc::new(ScriptedStreamSource::new());
        let lease_store = Arc::new(InMemoryLeaseStore::new());
        lease_store.seed(owned_lease("worker-1", "shard-0", SequencePosition::TrimHorizon));

        let scheduler = single_stream_scheduler(source, lease_store.clone(), StreamIdentifier::single("orders"));

        scheduler.run_process_loop_once().await.unwrap();

        let mut lease = lease_store.get_lease("shard-0").await.unwrap().unwrap();
        lease.checkpoint = SequencePosition::Sequence {
            sequence_number: "100".to_string(),
            sub_sequence_number: None,
        };
        let lease = lease_store
            .update_lease_with_meta_info(&lease, LeaseUpdateField::Checkpoint)
            .await
            .unwrap();
        scheduler.run_process_loop_once().await.unwrap();

        let mut lease = lease;
        lease.checkpoint = SequencePosition::Sequence {
            sequence_number: "200".to_string(),
            sub_sequence_number: None,
        };
        lease_store
            .update_lease_with_meta_info(&lease, LeaseUpdateField::Checkpoint)
            .await
            .unwrap();
        scheduler.run_process_loop_once().await.unwrap();

        assert_eq!(scheduler.metrics().consumers_built, 1);
        assert_eq!(scheduler.registry().len(), 1);
    }

    #[tokio::test]
    async fn shard_end_checkpoint_is_never_built() {
        let source = Arc::new(ScriptedStreamSource::new());
        let lease_store = Arc::new(InMemoryLeaseStore::new());
        lease_store.seed(owned_lease("worker-1", "shard-0", SequencePosition::ShardEnd));

        let scheduler = single_stream_scheduler(source, lease_store, StreamIdentifier::single("orders"));
        scheduler.run_process_loop_once().await.unwrap();

        assert_eq!(scheduler.metrics().consumers_built, 0);
        assert!(scheduler.registry().is_empty());
    }

    #[tokio::test]
    async fn leases_not_owned_by_this_worker_are_ignored() {
        let source = Arc::new(ScriptedStreamSource::new());
        let lease_store = Arc::new(InMemoryLeaseStore::new());
        lease_store.seed(owned_lease("worker-2", "shard-0", SequencePosition::Latest));

        let scheduler = single_stream_scheduler(source, lease_store, StreamIdentifier::single("orders"));
        scheduler.run_process_loop_once().await.unwrap();

        assert!(scheduler.registry().is_empty());
    }

    /// If a stream goes absent from the tracker and the deferment period has
    /// not yet elapsed, it stays in the current stream config map and is
    /// recorded as stale, but is not removed or re-synced.
    #[tokio::test]
    async fn stale_stream_is_deferred_before_expiry() {
        let source = Arc::new(ScriptedStreamSource::new());
        let lease_store = Arc::new(InMemoryLeaseStore::new());
        let streams: Vec<StreamConfig> = (1..=2)
            .map(|n| StreamConfig::new(StreamIdentifier::single(format!("s{n}")), InitialPosition::Latest))
            .collect();
        let tracker = Arc::new(ScriptedTracker::new(streams.clone()));

        let config = CoordinatorConfig::new("worker-1").with_old_stream_deferred_deletion_period(Duration::from_secs(3600));
        let scheduler = Scheduler::new_multi_stream(
            config,
            tracker.clone(),
            source,
            lease_store,
            Arc::new(FakeLeaderDecider::leader()),
            |_info| FakeShardConsumer::new(),
        );

        scheduler.initialize().await.unwrap();
        tracker.set(vec![streams[0].clone()]);
        scheduler.run_process_loop_once().await.unwrap();

        let current = scheduler.current_stream_identifiers();
        let stale = scheduler.stale_stream_identifiers();
        assert!(current.contains(&StreamIdentifier::single("s2")));
        assert!(stale.contains(&StreamIdentifier::single("s2")));
    }

    /// With a zero deferment period, an absent stream is removed from the
    /// current stream config map and counted as synced-away in the same
    /// tick.
    #[tokio::test]
    async fn stale_stream_expires_immediately_with_zero_deferment() {
        let source = Arc::new(ScriptedStreamSource::new());
        let lease_store = Arc::new(InMemoryLeaseStore::new());
        let streams: Vec<StreamConfig> = (1..=2)
            .map(|n| StreamConfig::new(StreamIdentifier::single(format!("s{n}")), InitialPosition::Latest))
            .collect();
        let tracker = Arc::new(ScriptedTracker::new(streams.clone()));

        let config = CoordinatorConfig::new("worker-1").with_old_stream_deferred_deletion_period(Duration::from_secs(0));
        let scheduler = Scheduler::new_multi_stream(
            config,
            tracker.clone(),
            source,
            lease_store,
            Arc::new(FakeLeaderDecider::leader()),
            |_info| FakeShardConsumer::new(),
        );

        scheduler.initialize().await.unwrap();
        tracker.set(vec![streams[0].clone()]);
        scheduler.run_process_loop_once().await.unwrap();

        let current = scheduler.current_stream_identifiers();
        let stale = scheduler.stale_stream_identifiers();
        assert!(!current.contains(&StreamIdentifier::single("s2")));
        assert!(!stale.contains(&StreamIdentifier::single("s2")));
        assert_eq!(scheduler.metrics().streams_expired, 1);
    }

    /// A stream that reappears before its deferment elapses resumes without
    /// being dropped from the current stream config map or re-synced as
    /// "new".
    #[tokio::test]
    async fn reappearing_stream_is_not_treated_as_new() {
        let source = Arc::new(ScriptedStreamSource::new());
        let lease_store = Arc::new(InMemoryLeaseStore::new());
        let streams: Vec<StreamConfig> = (1..=2)
            .map(|n| StreamConfig::new(StreamIdentifier::single(format!("s{n}")), InitialPosition::Latest))
            .collect();
        let tracker = Arc::new(ScriptedTracker::new(streams.clone()));

        let config = CoordinatorConfig::new("worker-1").with_old_stream_deferred_deletion_period(Duration::from_secs(3600));
        let scheduler = Scheduler::new_multi_stream(
            config,
            tracker.clone(),
            source,
            lease_store,
            Arc::new(FakeLeaderDecider::leader()),
            |_info| FakeShardConsumer::new(),
        );

        scheduler.initialize().await.unwrap();
        tracker.set(vec![streams[0].clone()]);
        scheduler.run_process_loop_once().await.unwrap();
        assert!(scheduler.stale_stream_identifiers().contains(&StreamIdentifier::single("s2")));

        tracker.set(streams.clone());
        scheduler.run_process_loop_once().await.unwrap();

        assert!(scheduler.current_stream_identifiers().contains(&StreamIdentifier::single("s2")));
        assert!(!scheduler.stale_stream_identifiers().contains(&StreamIdentifier::single("s2")));
        assert_eq!(scheduler.metrics().streams_synced_new, 0);
    }

    /// `list_shards` always failing bounds initialization to exactly
    /// `max_initialization_attempts` calls in single-stream mode.
    #[tokio::test]
    async fn initialization_retry_is_bounded_in_single_stream_mode() {
        let source = Arc::new(ScriptedStreamSource::new());
        source.fail_list_shards_n_times(StreamIdentifier::single("orders"), u32::MAX);
        let lease_store = Arc::new(InMemoryLeaseStore::new());

        let config = CoordinatorConfig::new("worker-1")
            .with_max_initialization_attempts(4)
            .with_parent_shard_poll_interval(Duration::from_millis(1));
        let scheduler = Scheduler::new_single_stream(
            config,
            StreamConfig::new(StreamIdentifier::single("orders"), InitialPosition::Latest),
            source.clone(),
            lease_store,
            Arc::new(FakeLeaderDecider::leader()),
            |_info| FakeShardConsumer::new(),
        );

        let err = scheduler.initialize().await.unwrap_err();
        assert!(matches!(err, SchedulerError::InitializationFailed { attempts: 4, .. }));
        assert_eq!(source.list_shards_call_count(&StreamIdentifier::single("orders")), 4);
    }

    /// With four streams each failing their first attempt and succeeding
    /// thereafter, per-stream `list_shards` call counts fall in `[2, max]`:
    /// every stream needs at least one retry, and none needs more than the
    /// full attempt budget.
    #[tokio::test]
    async fn multi_stream_retry_counts_fall_within_expected_range() {
        let source = Arc::new(ScriptedStreamSource::new());
        let streams: Vec<StreamConfig> = (1..=4)
            .map(|n| {
                let id = StreamIdentifier::single(format!("s{n}"));
                source.fail_list_shards_n_times(id.clone(), 1);
                StreamConfig::new(id, InitialPosition::Latest)
            })
            .collect();
        let tracker = Arc::new(ScriptedTracker::new(streams));
        let lease_store = Arc::new(InMemoryLeaseStore::new());

        let config = CoordinatorConfig::new("worker-1")
            .with_max_initialization_attempts(5)
            .with_parent_shard_poll_interval(Duration::from_millis(1));
        let scheduler = Scheduler::new_multi_stream(
            config,
            tracker,
            source.clone(),
            lease_store,
            Arc::new(FakeLeaderDecider::leader()),
            |_info| FakeShardConsumer::new(),
        );

        scheduler.initialize().await.unwrap();

        for n in 1..=4 {
            let count = source.list_shards_call_count(&StreamIdentifier::single(format!("s{n}")));
            assert!((2..=5).contains(&count), "stream s{n} had {count} calls");
        }
    }

    /// Shutdown publishes `SHUT_DOWN_STARTED` strictly before `SHUT_DOWN`,
    /// and both strictly after the managers have been stopped.
    #[tokio::test]
    async fn shutdown_publishes_states_in_order() {
        struct RecordingListener(StdMutex<Vec<WorkerState>>);
        impl WorkerStateChangeListener for RecordingListener {
            fn on_worker_state_change(&self, state: WorkerState) {
                self.0.lock().unwrap().push(state);
            }
        }

        let source = Arc::new(ScriptedStreamSource::new());
        let lease_store = Arc::new(InMemoryLeaseStore::new());
        let listener = Arc::new(RecordingListener(StdMutex::new(Vec::new())));

        let scheduler = single_stream_scheduler(source, lease_store, StreamIdentifier::single("orders"))
            .with_state_listener(listener.clone());

        scheduler.initialize().await.unwrap();
        scheduler.shutdown().await;

        let observed = listener.0.lock().unwrap().clone();
        let started_idx = observed.iter().position(|s| *s == WorkerState::ShutDownStarted).unwrap();
        let done_idx = observed.iter().position(|s| *s == WorkerState::ShutDown).unwrap();
        assert!(started_idx < done_idx);
        assert_eq!(observed.last(), Some(&WorkerState::ShutDown));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let source = Arc::new(ScriptedStreamSource::new());
        let lease_store = Arc::new(InMemoryLeaseStore::new());
        let scheduler = single_stream_scheduler(source, lease_store, StreamIdentifier::single("orders"));

        scheduler.initialize().await.unwrap();
        scheduler.shutdown().await;
        scheduler.shutdown().await;
        assert!(scheduler.is_shut_down());
    }

    #[tokio::test]
    async fn run_after_shutdown_is_a_contract_violation() {
        let source = Arc::new(ScriptedStreamSource::new());
        let lease_store = Arc::new(InMemoryLeaseStore::new());
        let scheduler = single_stream_scheduler(source, lease_store, StreamIdentifier::single("orders"));

        scheduler.initialize().await.unwrap();
        scheduler.shutdown().await;

        let err = scheduler.run().await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyShutDown));
    }
}
