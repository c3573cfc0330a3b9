//! `ShardConsumerRegistry`: the index of live per-shard consumers, keyed by
//! `(stream_identifier, shard_id, concurrency_token)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::interfaces::ShardConsumer;
use crate::model::{ConsumerIdentity, ShardInfo};

/// Index of live consumers keyed by shard identity. Production use is
/// single-writer (the Scheduler task); internally synchronized with a plain
/// `Mutex` anyway so that repeated identity lookups stay consistent even
/// under concurrent test exercise.
pub struct ShardConsumerRegistry<C: ShardConsumer> {
    consumers: Mutex<HashMap<ConsumerIdentity, Arc<C>>>,
}

impl<C: ShardConsumer> Default for ShardConsumerRegistry<C> {
    fn default() -> Self {
        Self {
            consumers: Mutex::new(HashMap::new()),
        }
    }
}

impl<C: ShardConsumer> ShardConsumerRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing consumer for `shard_info`'s identity, or
    /// constructs one via `factory` and inserts it. Two calls with the same
    /// `shard_id` but a different `concurrency_token` are distinct
    /// identities and so produce distinct consumers: a re-leased shard is a
    /// new ownership epoch, not a continuation of the old one.
    pub fn create_or_get(
        &self,
        shard_info: &ShardInfo,
        factory: impl FnOnce(&ShardInfo) -> C,
    ) -> (Arc<C>, bool) {
        let identity = shard_info.identity();
        let mut consumers = self.consumers.lock().unwrap();
        if let Some(existing) = consumers.get(&identity) {
            return (existing.clone(), false);
        }
        let consumer = Arc::new(factory(shard_info));
        consumers.insert(identity, consumer.clone());
        (consumer, true)
    }

    /// Requests shutdown of every registered consumer whose identity is not
    /// present in `active_shard_infos`. Consumers that are present are left
    /// untouched.
    pub fn retire_absent<'a>(&self, active_shard_infos: impl IntoIterator<Item = &'a ShardInfo>) {
        let active: std::collections::HashSet<ConsumerIdentity> =
            active_shard_infos.into_iter().map(ShardInfo::identity).collect();

        let consumers = self.consumers.lock().unwrap();
        for (identity, consumer) in consumers.iter() {
            if !active.contains(identity) {
                tracing::debug!(shard_id = %identity.shard_id, "requesting shutdown of retired consumer");
                consumer.request_shutdown();
            }
        }
    }

    /// Removes consumers whose shutdown has fully completed.
    pub fn sweep_finished(&self) {
        let mut consumers = self.consumers.lock().unwrap();
        consumers.retain(|_, consumer| !consumer.is_shutdown_complete());
    }

    pub fn len(&self) -> usize {
        self.consumers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity: &ConsumerIdentity) -> bool {
        self.consumers.lock().unwrap().contains_key(identity)
    }
}
