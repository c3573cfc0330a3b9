//! `LeaseCleanupManager`: reaps leases for shards that have ended (completed)
//! or disappeared from the source (garbage), subject to parent/child lineage
//! constraints.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CleanupError;
use crate::interfaces::{IteratorPosition, LeaseStore, StreamSource};
use crate::model::{Lease, LeaseUpdateField, ShardInfo, StreamIdentifier};

/// An entry in the cleanup manager's deletion queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeasePendingDeletion {
    pub stream_identifier: Option<StreamIdentifier>,
    pub lease: Lease,
    pub shard_info: ShardInfo,
}

impl LeasePendingDeletion {
    pub fn new(lease: Lease, shard_info: ShardInfo) -> Self {
        Self {
            stream_identifier: shard_info.stream_identifier.clone(),
            lease,
            shard_info,
        }
    }
}

/// Outcome of a single `cleanup_leases` tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupOutcome {
    pub cleaned_up_completed: u32,
    pub cleaned_up_garbage: u32,
    pub re_enqueued: u32,
}

/// Cumulative counters, standing in for a metrics sink this crate doesn't
/// depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupMetrics {
    pub completed_leases_reaped: u64,
    pub garbage_leases_reaped: u64,
}

struct Stopwatch {
    interval: Duration,
    /// `None` means "never reset" and always counts as elapsed, sidestepping
    /// the underflow a freshly-booted host's monotonic clock would hit if we
    /// tried to back-date an initial `Instant` by `interval`.
    last_reset: Mutex<Option<Instant>>,
}

impl Stopwatch {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_reset: Mutex::new(None),
        }
    }

    fn elapsed(&self) -> bool {
        match *self.last_reset.lock().unwrap() {
            None => true,
            Some(last) => last.elapsed() >= self.interval,
        }
    }

    fn reset(&self) {
        *self.last_reset.lock().unwrap() = Some(Instant::now());
    }
}

/// Drains a FIFO queue of pending lease deletions, gated by two independent
/// cadences for the completed-lease and garbage-lease reaping paths.
pub struct LeaseCleanupManager {
    lease_store: std::sync::Arc<dyn LeaseStore>,
    source: std::sync::Arc<dyn StreamSource>,
    cleanup_leases_upon_shard_completion: bool,
    max_future_wait: Duration,
    /// The deployment's single-stream identifier, used as a fallback when a
    /// lease carries no `stream_identifier` of its own. `None` in multi-stream
    /// deployments, where every lease is expected to carry one.
    default_stream_identifier: Option<StreamIdentifier>,
    queue_tx: mpsc::UnboundedSender<LeasePendingDeletion>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<LeasePendingDeletion>>,
    queued_keys: Mutex<HashSet<String>>,
    completed_stopwatch: Stopwatch,
    garbage_stopwatch: Stopwatch,
    metrics: AtomicMetrics,
    is_running: AtomicBool,
    cancel: CancellationToken,
}

#[derive(Default)]
struct AtomicMetrics {
    completed: AtomicU64,
    garbage: AtomicU64,
}

impl LeaseCleanupManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lease_store: std::sync::Arc<dyn LeaseStore>,
        source: std::sync::Arc<dyn StreamSource>,
        cleanup_leases_upon_shard_completion: bool,
        completed_lease_cleanup_interval: Duration,
        garbage_lease_cleanup_interval: Duration,
        max_future_wait: Duration,
        default_stream_identifier: Option<StreamIdentifier>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            lease_store,
            source,
            cleanup_leases_upon_shard_completion,
            max_future_wait,
            default_stream_identifier,
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            queued_keys: Mutex::new(HashSet::new()),
            completed_stopwatch: Stopwatch::new(completed_lease_cleanup_interval),
            garbage_stopwatch: Stopwatch::new(garbage_lease_cleanup_interval),
            metrics: AtomicMetrics::default(),
            is_running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts the periodic background task that calls `cleanup_leases` every
    /// `interval`. Mutually exclusive with a second `start`; `stop` followed
    /// by `start` is allowed.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                this.cleanup_leases().await;
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        self.is_running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Enqueues a lease for deletion consideration. Rejects (with a warning,
    /// returning `false`) a re-enqueue of an entry that is value-equal to one
    /// already queued — an absent/`None` lease cannot be enqueued at all
    /// because `LeasePendingDeletion` owns a materialized `Lease`.
    pub fn enqueue(&self, entry: LeasePendingDeletion) -> bool {
        let mut keys = self.queued_keys.lock().unwrap();
        if !keys.insert(entry.lease.lease_key.clone()) {
            tracing::warn!(lease_key = %entry.lease.lease_key, "duplicate pending-deletion entry rejected");
            return false;
        }
        drop(keys);
        // queue_tx.send only fails if every receiver was dropped, which only
        // happens when this manager itself has been dropped.
        let _ = self.queue_tx.send(entry);
        true
    }

    pub fn metrics(&self) -> CleanupMetrics {
        CleanupMetrics {
            completed_leases_reaped: self.metrics.completed.load(Ordering::Relaxed),
            garbage_leases_reaped: self.metrics.garbage.load(Ordering::Relaxed),
        }
    }

    /// One cleanup tick. No-ops if the queue is empty or neither cadence gate
    /// has elapsed; otherwise drains the queue fully, retrying failed entries
    /// by re-enqueuing them at the tail.
    pub async fn cleanup_leases(&self) -> CleanupOutcome {
        let completed_gate = self.completed_stopwatch.elapsed();
        let garbage_gate = self.garbage_stopwatch.elapsed();
        if !completed_gate && !garbage_gate {
            return CleanupOutcome::default();
        }

        let drained = self.drain_queue();
        if drained.is_empty() {
            return CleanupOutcome::default();
        }

        let mut outcome = CleanupOutcome::default();
        for entry in drained {
            let lease_key = entry.lease.lease_key.clone();
            self.queued_keys.lock().unwrap().remove(&lease_key);

            match self.cleanup_lease(&entry, completed_gate, garbage_gate).await {
                Ok(CleanupResult::CompletedLeaseReaped) => {
                    outcome.cleaned_up_completed += 1;
                    self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(CleanupResult::GarbageLeaseReaped) => {
                    outcome.cleaned_up_garbage += 1;
                    self.metrics.garbage.fetch_add(1, Ordering::Relaxed);
                }
                Ok(CleanupResult::NotYetEligible) => {
                    // Requeue silently: lineage not yet satisfied, try again
                    // next tick.
                    self.enqueue(entry);
                }
                Err(err) => {
                    tracing::warn!(lease_key = %lease_key, error = %err, "lease cleanup failed, re-enqueuing");
                    self.enqueue(entry);
                    outcome.re_enqueued += 1;
                }
            }
        }

        if outcome.cleaned_up_completed > 0 {
            self.completed_stopwatch.reset();
        }
        if outcome.cleaned_up_garbage > 0 {
            self.garbage_stopwatch.reset();
        }

        outcome
    }

    fn drain_queue(&self) -> Vec<LeasePendingDeletion> {
        let mut rx = self.queue_rx.lock().unwrap();
        let mut drained = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            drained.push(entry);
        }
        drained
    }

    /// Decides whether a queued lease is eligible for completed- or
    /// garbage-reaping this tick, trying the completed path first when it's
    /// enabled and its cadence gate has elapsed.
    async fn cleanup_lease(
        &self,
        entry: &LeasePendingDeletion,
        completed_gate: bool,
        garbage_gate: bool,
    ) -> Result<CleanupResult, CleanupError> {
        if self.cleanup_leases_upon_shard_completion && completed_gate {
            match self.try_completed_cleanup(entry).await {
                Ok(result) => return Ok(result),
                Err(CleanupError::Source(source_err)) if source_err.is_resource_not_found() => {
                    // fall through to the garbage path below
                }
                Err(other) => return Err(other),
            }
        }

        if garbage_gate {
            return self.try_garbage_cleanup(entry).await;
        }

        Ok(CleanupResult::NotYetEligible)
    }

    async fn try_completed_cleanup(
        &self,
        entry: &LeasePendingDeletion,
    ) -> Result<CleanupResult, CleanupError> {
        let mut lease = entry.lease.clone();

        if lease.child_shard_ids.is_none() {
            let children = self.discover_child_shards(entry).await?;
            lease.child_shard_ids = Some(children.clone());
            lease = tokio::time::timeout(
                self.max_future_wait,
                self.lease_store
                    .update_lease_with_meta_info(&lease, LeaseUpdateField::ChildShards),
            )
            .await
            .map_err(|_| CleanupError::Source(crate::error::SourceError::Timeout))??;
        }

        // All parent leases must already be deleted.
        for parent_shard_id in &lease.parent_shard_ids {
            let parent_key = crate::model::lease_key_for(entry.stream_identifier.as_ref(), parent_shard_id);
            if self.lease_store.get_lease(&parent_key).await?.is_some() {
                return Ok(CleanupResult::NotYetEligible);
            }
        }

        // All children must be past their initial position.
        if let Some(child_shard_ids) = &lease.child_shard_ids {
            for child_shard_id in child_shard_ids {
                let child_key = crate::model::lease_key_for(entry.stream_identifier.as_ref(), child_shard_id);
                let child_lease = self
                    .lease_store
                    .get_lease(&child_key)
                    .await?
                    .ok_or_else(|| CleanupError::InvariantViolation(child_key.clone()))?;
                if child_lease.checkpoint.has_not_started() {
                    return Ok(CleanupResult::NotYetEligible);
                }
            }
        }

        self.lease_store.delete_lease(&lease).await?;
        Ok(CleanupResult::CompletedLeaseReaped)
    }

    async fn try_garbage_cleanup(&self, entry: &LeasePendingDeletion) -> Result<CleanupResult, CleanupError> {
        match self.discover_child_shards(entry).await {
            Ok(_) => Ok(CleanupResult::NotYetEligible),
            Err(CleanupError::Source(source_err)) if source_err.is_resource_not_found() => {
                self.lease_store.delete_lease(&entry.lease).await?;
                Ok(CleanupResult::GarbageLeaseReaped)
            }
            Err(other) => Err(other),
        }
    }

    /// Probes the source for the shard's child shards by creating a `LATEST`
    /// iterator and reading up to one record.
    async fn discover_child_shards(
        &self,
        entry: &LeasePendingDeletion,
    ) -> Result<Vec<crate::model::ShardId>, CleanupError> {
        let stream_identifier = entry
            .stream_identifier
            .clone()
            .or_else(|| self.default_stream_identifier.clone())
            .ok_or_else(|| CleanupError::InvariantViolation(entry.lease.lease_key.clone()))?;

        let fetch = async {
            let iterator = self
                .source
                .get_shard_iterator(&stream_identifier, &entry.shard_info.shard_id, IteratorPosition::Latest)
                .await?;
            let response = self.source.get_records(&iterator, 1).await?;
            Ok::<_, crate::error::SourceError>(
                response
                    .child_shards
                    .unwrap_or_default()
                    .into_iter()
                    .map(|d| d.shard_id)
                    .collect(),
            )
        };

        match tokio::time::timeout(self.max_future_wait, fetch).await {
            Ok(result) => result.map_err(CleanupError::Source),
            Err(_) => Err(CleanupError::Source(crate::error::SourceError::Timeout)),
        }
    }
}

enum CleanupResult {
    CompletedLeaseReaped,
    GarbageLeaseReaped,
    NotYetEligible,
}
