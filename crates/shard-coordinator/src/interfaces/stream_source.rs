//! `StreamSource`: the abstracted shard-listing / iterator / record-fetch API
//! of the upstream partitioned stream. This crate only depends on the trait;
//! the stream implementation lives elsewhere.

use async_trait::async_trait;

use crate::error::SourceError;
use crate::model::{ShardId, StreamIdentifier};

/// A shard as reported by `StreamSource::list_shards`, prior to lease
/// assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub shard_id: ShardId,
    pub parent_shard_ids: Vec<ShardId>,
}

/// Where a newly created iterator should start reading from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    Latest,
    TrimHorizon,
    AtTimestamp(i64),
    AfterSequenceNumber { sequence_number: String },
}

/// Opaque handle returned by `get_shard_iterator`, passed back into
/// `get_records`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorToken(pub String);

/// Result of a `get_records` call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetRecordsResponse {
    pub records: Vec<Vec<u8>>,
    /// Populated only once the shard has reached its end (split/merge).
    pub child_shards: Option<Vec<ShardDescriptor>>,
    pub next_iterator_token: Option<IteratorToken>,
}

/// The abstracted stream source API: shard listing, iterator creation, and
/// record fetching. Implementations own retry/backoff and transport details;
/// the coordinator only consumes this trait.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn list_shards(
        &self,
        stream_identifier: &StreamIdentifier,
    ) -> Result<Vec<ShardDescriptor>, SourceError>;

    async fn get_shard_iterator(
        &self,
        stream_identifier: &StreamIdentifier,
        shard_id: &ShardId,
        position: IteratorPosition,
    ) -> Result<IteratorToken, SourceError>;

    async fn get_records(
        &self,
        iterator_token: &IteratorToken,
        limit: u32,
    ) -> Result<GetRecordsResponse, SourceError>;
}
