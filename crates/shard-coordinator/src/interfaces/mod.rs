pub mod lease_store;
pub mod leader_decider;
pub mod shard_consumer;
pub mod stream_source;

pub use lease_store::LeaseStore;
pub use leader_decider::LeaderDecider;
pub use shard_consumer::{ConsumerState, ShardConsumer};
pub use stream_source::{GetRecordsResponse, IteratorPosition, IteratorToken, ShardDescriptor, StreamSource};
