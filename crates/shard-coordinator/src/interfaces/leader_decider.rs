//! `LeaderDecider`: leader election, abstracted as a trait. The election
//! mechanism itself lives outside this crate.

use async_trait::async_trait;

/// Decides whether `worker_id` currently holds leadership. Queries are
/// expected to be synchronous and fast (no network round trip on the hot
/// path); the trait is still `async` so implementations backed by a cached,
/// periodically-refreshed view can be expressed without blocking.
#[async_trait]
pub trait LeaderDecider: Send + Sync {
    async fn is_leader(&self, worker_id: &str) -> bool;

    async fn shutdown(&self);
}
