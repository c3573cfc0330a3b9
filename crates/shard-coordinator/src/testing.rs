//! In-memory fakes for every external collaborator trait, reused by this
//! crate's own unit tests and exposed (behind `feature = "testing"`) for
//! downstream integration tests — the same role `journal-client`'s small
//! reusable retry/backoff test helpers play for its own test suite.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{SourceError, StoreError};
use crate::interfaces::{
    ConsumerState, GetRecordsResponse, IteratorPosition, IteratorToken, LeaderDecider, LeaseStore,
    ShardConsumer, ShardDescriptor, StreamSource,
};
use crate::model::{Lease, LeaseUpdateField, ShardId, StreamIdentifier};

pub mod fakes {
    use super::*;

    /// A `ShardConsumer` whose shutdown is driven explicitly by the test,
    /// rather than by an internal state machine.
    pub struct FakeShardConsumer {
        shutdown_requested: AtomicBool,
        shutdown_complete: AtomicBool,
    }

    impl FakeShardConsumer {
        pub fn new() -> Self {
            Self {
                shutdown_requested: AtomicBool::new(false),
                shutdown_complete: AtomicBool::new(false),
            }
        }

        pub fn shutdown_requested(&self) -> bool {
            self.shutdown_requested.load(Ordering::SeqCst)
        }

        /// Test-only: simulate the consumer's shutdown finishing.
        pub fn complete_shutdown(&self) {
            self.shutdown_complete.store(true, Ordering::SeqCst);
        }
    }

    impl Default for FakeShardConsumer {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ShardConsumer for FakeShardConsumer {
        fn request_shutdown(&self) {
            self.shutdown_requested.store(true, Ordering::SeqCst);
        }

        fn is_shutdown_complete(&self) -> bool {
            self.shutdown_complete.load(Ordering::SeqCst)
        }

        fn state(&self) -> ConsumerState {
            if self.shutdown_complete.load(Ordering::SeqCst) {
                ConsumerState::Shutdown
            } else if self.shutdown_requested.load(Ordering::SeqCst) {
                ConsumerState::Ending
            } else {
                ConsumerState::Processing
            }
        }
    }
}

/// A `LeaderDecider` whose answer is set by the test.
pub struct FakeLeaderDecider {
    is_leader: AtomicBool,
}

impl FakeLeaderDecider {
    pub fn leader() -> Self {
        Self {
            is_leader: AtomicBool::new(true),
        }
    }

    pub fn follower() -> Self {
        Self {
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::SeqCst);
    }
}

#[async_trait]
impl LeaderDecider for FakeLeaderDecider {
    async fn is_leader(&self, _worker_id: &str) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {}
}

/// An in-memory `LeaseStore` with optimistic-concurrency semantics matching
/// the trait's contract.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, lease: Lease) {
        self.leases.lock().unwrap().insert(lease.lease_key.clone(), lease);
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError> {
        Ok(self.leases.lock().unwrap().values().cloned().collect())
    }

    async fn get_lease(&self, lease_key: &str) -> Result<Option<Lease>, StoreError> {
        Ok(self.leases.lock().unwrap().get(lease_key).cloned())
    }

    async fn create_lease_if_not_exists(&self, lease: Lease) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().unwrap();
        if leases.contains_key(&lease.lease_key) {
            return Err(StoreError::LeaseAlreadyExists(lease.lease_key));
        }
        leases.insert(lease.lease_key.clone(), lease);
        Ok(())
    }

    async fn delete_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get(&lease.lease_key) {
            None => Err(StoreError::LeaseNotFound(lease.lease_key.clone())),
            Some(stored) if stored.lease_counter != lease.lease_counter => {
                Err(StoreError::ConcurrentModification {
                    lease_key: lease.lease_key.clone(),
                    expected: stored.lease_counter,
                })
            }
            Some(_) => {
                leases.remove(&lease.lease_key);
                Ok(())
            }
        }
    }

    async fn update_lease_with_meta_info(
        &self,
        lease: &Lease,
        _field: LeaseUpdateField,
    ) -> Result<Lease, StoreError> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get(&lease.lease_key) {
            None => Err(StoreError::LeaseNotFound(lease.lease_key.clone())),
            Some(stored) if stored.lease_counter != lease.lease_counter => {
                Err(StoreError::ConcurrentModification {
                    lease_key: lease.lease_key.clone(),
                    expected: stored.lease_counter,
                })
            }
            Some(_) => {
                let mut updated = lease.clone();
                updated.lease_counter += 1;
                leases.insert(updated.lease_key.clone(), updated.clone());
                Ok(updated)
            }
        }
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<Lease, StoreError> {
        self.update_lease_with_meta_info(lease, LeaseUpdateField::Checkpoint).await
    }

    async fn take_lease(&self, lease: &Lease, new_owner: &str) -> Result<Lease, StoreError> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get(&lease.lease_key) {
            None => Err(StoreError::LeaseNotFound(lease.lease_key.clone())),
            Some(stored) if stored.lease_counter != lease.lease_counter => {
                Err(StoreError::ConcurrentModification {
                    lease_key: lease.lease_key.clone(),
                    expected: stored.lease_counter,
                })
            }
            Some(_) => {
                let mut updated = lease.clone();
                updated.owner = Some(new_owner.to_string());
                updated.lease_counter += 1;
                updated.concurrency_token = crate::model::fresh_concurrency_token();
                leases.insert(updated.lease_key.clone(), updated.clone());
                Ok(updated)
            }
        }
    }
}

/// A `StreamSource` whose `list_shards` can be scripted to fail a fixed
/// number of times per stream before succeeding (used by the
/// initialization-retry tests), and whose per-shard `get_records` behavior
/// (child shards discovered, or resource-not-found) is configured per shard
/// (used by the cleanup-manager lineage tests).
#[derive(Default)]
pub struct ScriptedStreamSource {
    shards: Mutex<HashMap<StreamIdentifier, Vec<ShardDescriptor>>>,
    list_shards_failures_remaining: Mutex<HashMap<StreamIdentifier, u32>>,
    list_shards_call_counts: Mutex<HashMap<StreamIdentifier, u32>>,
    child_shards_by_shard: Mutex<HashMap<ShardId, Vec<ShardDescriptor>>>,
    not_found_shards: Mutex<HashSet<ShardId>>,
    resource_not_found_streams: Mutex<HashSet<StreamIdentifier>>,
}

impl ScriptedStreamSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shards(self, stream: StreamIdentifier, shards: Vec<ShardDescriptor>) -> Self {
        self.shards.lock().unwrap().insert(stream, shards);
        self
    }

    pub fn fail_list_shards_n_times(&self, stream: StreamIdentifier, n: u32) {
        self.list_shards_failures_remaining.lock().unwrap().insert(stream, n);
    }

    pub fn list_shards_call_count(&self, stream: &StreamIdentifier) -> u32 {
        self.list_shards_call_counts
            .lock()
            .unwrap()
            .get(stream)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_child_shards(&self, shard_id: ShardId, children: Vec<ShardDescriptor>) {
        self.child_shards_by_shard.lock().unwrap().insert(shard_id, children);
    }

    pub fn set_resource_not_found(&self, shard_id: ShardId) {
        self.not_found_shards.lock().unwrap().insert(shard_id);
    }

    pub fn set_stream_resource_not_found(&self, stream: StreamIdentifier) {
        self.resource_not_found_streams.lock().unwrap().insert(stream);
    }
}

static NEXT_ITERATOR_ID: AtomicU32 = AtomicU32::new(0);

#[async_trait]
impl StreamSource for ScriptedStreamSource {
    async fn list_shards(
        &self,
        stream_identifier: &StreamIdentifier,
    ) -> Result<Vec<ShardDescriptor>, SourceError> {
        *self
            .list_shards_call_counts
            .lock()
            .unwrap()
            .entry(stream_identifier.clone())
            .or_insert(0) += 1;

        if self.resource_not_found_streams.lock().unwrap().contains(stream_identifier) {
            return Err(SourceError::ResourceNotFound(stream_identifier.clone()));
        }

        let mut failures = self.list_shards_failures_remaining.lock().unwrap();
        if let Some(remaining) = failures.get_mut(stream_identifier) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SourceError::Dependency("scripted failure".to_string()));
            }
        }

        Ok(self
            .shards
            .lock()
            .unwrap()
            .get(stream_identifier)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_shard_iterator(
        &self,
        _stream_identifier: &StreamIdentifier,
        shard_id: &ShardId,
        _position: IteratorPosition,
    ) -> Result<IteratorToken, SourceError> {
        if self.not_found_shards.lock().unwrap().contains(shard_id) {
            return Err(SourceError::ShardNotFound {
                stream: StreamIdentifier::single("unknown"),
                shard_id: shard_id.clone(),
            });
        }
        let id = NEXT_ITERATOR_ID.fetch_add(1, Ordering::SeqCst);
        Ok(IteratorToken(format!("{}:{}", shard_id, id)))
    }

    async fn get_records(
        &self,
        iterator_token: &IteratorToken,
        _limit: u32,
    ) -> Result<GetRecordsResponse, SourceError> {
        let shard_id = ShardId::from(
            iterator_token
                .0
                .split(':')
                .next()
                .unwrap_or_default()
                .to_string(),
        );

        if self.not_found_shards.lock().unwrap().contains(&shard_id) {
            return Err(SourceError::ShardNotFound {
                stream: StreamIdentifier::single("unknown"),
                shard_id,
            });
        }

        let child_shards = self.child_shards_by_shard.lock().unwrap().get(&shard_id).cloned();
        Ok(GetRecordsResponse {
            records: Vec::new(),
            child_shards,
            next_iterator_token: None,
        })
    }
}
