//! Core data types shared by every subsystem: stream/shard identity, checkpoints, and leases.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a stream, either as a single bare name or as an account-scoped,
/// epoch-qualified multi-stream triple.
///
/// Canonical string form is `name` for single-stream, or `account:name:epoch` for
/// multi-stream. Equality is structural over all components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamIdentifier {
    Single { stream_name: String },
    Multi {
        account_id: String,
        stream_name: String,
        creation_epoch: i64,
    },
}

impl StreamIdentifier {
    pub fn single(stream_name: impl Into<String>) -> Self {
        StreamIdentifier::Single {
            stream_name: stream_name.into(),
        }
    }

    pub fn multi(
        account_id: impl Into<String>,
        stream_name: impl Into<String>,
        creation_epoch: i64,
    ) -> Self {
        StreamIdentifier::Multi {
            account_id: account_id.into(),
            stream_name: stream_name.into(),
            creation_epoch,
        }
    }

    pub fn stream_name(&self) -> &str {
        match self {
            StreamIdentifier::Single { stream_name } => stream_name,
            StreamIdentifier::Multi { stream_name, .. } => stream_name,
        }
    }

    pub fn serialize(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StreamIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamIdentifier::Single { stream_name } => write!(f, "{stream_name}"),
            StreamIdentifier::Multi {
                account_id,
                stream_name,
                creation_epoch,
            } => write!(f, "{account_id}:{stream_name}:{creation_epoch}"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid stream identifier: {0:?}")]
pub struct ParseStreamIdentifierError(String);

impl FromStr for StreamIdentifier {
    type Err = ParseStreamIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [name] => Ok(StreamIdentifier::single(*name)),
            [account, name, epoch] => {
                let creation_epoch = epoch
                    .parse()
                    .map_err(|_| ParseStreamIdentifierError(s.to_string()))?;
                Ok(StreamIdentifier::multi(*account, *name, creation_epoch))
            }
            _ => Err(ParseStreamIdentifierError(s.to_string())),
        }
    }
}

impl serde::Serialize for StreamIdentifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.serialize())
    }
}

impl<'de> serde::Deserialize<'de> for StreamIdentifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A stable shard identifier within a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ShardId(pub String);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        ShardId(s.to_string())
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        ShardId(s)
    }
}

/// Opaque nonce distinguishing successive ownership epochs of the same shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ConcurrencyToken(pub String);

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConcurrencyToken {
    fn from(s: &str) -> Self {
        ConcurrencyToken(s.to_string())
    }
}

impl From<String> for ConcurrencyToken {
    fn from(s: String) -> Self {
        ConcurrencyToken(s)
    }
}

static CONCURRENCY_TOKEN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Mints a fresh `ConcurrencyToken`. Called exactly once per ownership
/// acquisition (initial lease creation, or a takeover to a new owner) —
/// never on a renewal or a checkpoint update, since those don't start a new
/// tenancy. Distinct from `lease_counter`, which a `LeaseStore` bumps on
/// every conditional write including in-place checkpoint advances.
pub fn fresh_concurrency_token() -> ConcurrencyToken {
    let n = CONCURRENCY_TOKEN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    ConcurrencyToken(n.to_string())
}

/// A shard's checkpoint: either a well-known sentinel, or a numeric sequence
/// position with an optional sub-sequence number (for aggregated records).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SequencePosition {
    TrimHorizon,
    Latest,
    AtTimestamp,
    Sequence {
        sequence_number: String,
        sub_sequence_number: Option<u64>,
    },
    ShardEnd,
}

impl SequencePosition {
    /// True for the sentinels meaning "this shard has not yet begun processing":
    /// `TRIM_HORIZON` and `AT_TIMESTAMP`. Per the cleanup-manager lineage check,
    /// `LATEST` and any numeric sequence (or `SHARD_END`) count as started.
    pub fn has_not_started(&self) -> bool {
        matches!(self, SequencePosition::TrimHorizon | SequencePosition::AtTimestamp)
    }

    pub fn is_shard_end(&self) -> bool {
        matches!(self, SequencePosition::ShardEnd)
    }
}

impl fmt::Display for SequencePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequencePosition::TrimHorizon => write!(f, "TRIM_HORIZON"),
            SequencePosition::Latest => write!(f, "LATEST"),
            SequencePosition::AtTimestamp => write!(f, "AT_TIMESTAMP"),
            SequencePosition::ShardEnd => write!(f, "SHARD_END"),
            SequencePosition::Sequence {
                sequence_number,
                sub_sequence_number,
            } => match sub_sequence_number {
                Some(sub) => write!(f, "{sequence_number}.{sub}"),
                None => write!(f, "{sequence_number}"),
            },
        }
    }
}

/// The starting position a newly discovered shard should be consumed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InitialPosition {
    Latest,
    TrimHorizon,
    /// Epoch millis.
    AtTimestamp(i64),
}

impl InitialPosition {
    pub fn initial_checkpoint(&self) -> SequencePosition {
        match self {
            InitialPosition::Latest => SequencePosition::Latest,
            InitialPosition::TrimHorizon => SequencePosition::TrimHorizon,
            InitialPosition::AtTimestamp(_) => SequencePosition::AtTimestamp,
        }
    }
}

/// Declares a stream this worker fleet should consume, and where newly
/// discovered shards of it should start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub stream_identifier: StreamIdentifier,
    pub initial_position: InitialPosition,
}

impl StreamConfig {
    pub fn new(stream_identifier: StreamIdentifier, initial_position: InitialPosition) -> Self {
        Self {
            stream_identifier,
            initial_position,
        }
    }
}

/// A shard as observed from the current lease assignment, carrying enough
/// identity to distinguish successive ownership epochs of the same shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardInfo {
    pub shard_id: ShardId,
    pub concurrency_token: ConcurrencyToken,
    pub parent_shard_ids: Vec<ShardId>,
    pub checkpoint: SequencePosition,
    pub stream_identifier: Option<StreamIdentifier>,
}

impl ShardInfo {
    /// The identity used for `ShardConsumerRegistry` lookups: a re-leased shard
    /// (new `concurrency_token`) is a distinct tenancy from its prior one.
    pub fn identity(&self) -> ConsumerIdentity {
        ConsumerIdentity {
            stream_identifier: self.stream_identifier.clone(),
            shard_id: self.shard_id.clone(),
            concurrency_token: self.concurrency_token.clone(),
        }
    }
}

/// Key type for `ShardConsumerRegistry`: `(stream_identifier, shard_id, concurrency_token)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerIdentity {
    pub stream_identifier: Option<StreamIdentifier>,
    pub shard_id: ShardId,
    pub concurrency_token: ConcurrencyToken,
}

/// A durable claim on a shard, as stored in the `LeaseStore`.
///
/// `shard_id` and `stream_identifier` are carried alongside the opaque
/// `lease_key` so the Scheduler can build a `ShardInfo` from a lease without
/// parsing the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lease {
    pub lease_key: String,
    pub shard_id: ShardId,
    pub stream_identifier: Option<StreamIdentifier>,
    pub owner: Option<String>,
    pub lease_counter: u64,
    /// Assigned once per ownership epoch by `fresh_concurrency_token()` at
    /// creation or takeover; untouched by renewals and checkpoint updates.
    pub concurrency_token: ConcurrencyToken,
    pub checkpoint: SequencePosition,
    pub parent_shard_ids: Vec<ShardId>,
    pub child_shard_ids: Option<Vec<ShardId>>,
    pub pending_checkpoint: Option<SequencePosition>,
}

impl Lease {
    pub fn new(
        shard_id: ShardId,
        stream_identifier: Option<StreamIdentifier>,
        checkpoint: SequencePosition,
    ) -> Self {
        let lease_key = lease_key_for(stream_identifier.as_ref(), &shard_id);
        Self {
            lease_key,
            shard_id,
            stream_identifier,
            owner: None,
            lease_counter: 0,
            concurrency_token: fresh_concurrency_token(),
            checkpoint,
            parent_shard_ids: Vec::new(),
            child_shard_ids: None,
            pending_checkpoint: None,
        }
    }

    pub fn with_parents(mut self, parent_shard_ids: Vec<ShardId>) -> Self {
        self.parent_shard_ids = parent_shard_ids;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn to_shard_info(&self) -> ShardInfo {
        ShardInfo {
            shard_id: self.shard_id.clone(),
            concurrency_token: self.concurrency_token.clone(),
            parent_shard_ids: self.parent_shard_ids.clone(),
            checkpoint: self.checkpoint.clone(),
            stream_identifier: self.stream_identifier.clone(),
        }
    }
}

/// Derives the deterministic lease key for a shard: the bare shard id for
/// single-stream, or `stream_identifier.serialize() + ":" + shard_id` for
/// multi-stream.
pub fn lease_key_for(stream_identifier: Option<&StreamIdentifier>, shard_id: &ShardId) -> String {
    match stream_identifier {
        None => shard_id.to_string(),
        Some(StreamIdentifier::Single { .. }) => shard_id.to_string(),
        Some(id @ StreamIdentifier::Multi { .. }) => format!("{}:{}", id.serialize(), shard_id),
    }
}

/// A field of a `Lease` updatable via `LeaseStore::update_lease_with_meta_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseUpdateField {
    ChildShards,
    Checkpoint,
    PendingCheckpoint,
    Owner,
}
