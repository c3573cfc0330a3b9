//! `LeaseStore`: the abstracted, conditionally-updatable persistent lease
//! table. The storage implementation lives outside this crate.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{Lease, LeaseUpdateField};

/// The abstracted lease store. All mutating operations are conditional on
/// `lease.lease_counter`, giving optimistic concurrency: a stale caller's
/// write is rejected with `StoreError::ConcurrentModification`.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError>;

    async fn get_lease(&self, lease_key: &str) -> Result<Option<Lease>, StoreError>;

    /// Creates the lease iff no lease with this key currently exists.
    async fn create_lease_if_not_exists(&self, lease: Lease) -> Result<(), StoreError>;

    /// Deletes the lease, conditional on `lease.lease_counter` still matching
    /// the stored value.
    async fn delete_lease(&self, lease: &Lease) -> Result<(), StoreError>;

    /// Updates a single field of the lease, conditional on `lease.lease_counter`.
    async fn update_lease_with_meta_info(
        &self,
        lease: &Lease,
        field: LeaseUpdateField,
    ) -> Result<Lease, StoreError>;

    /// Renews the lease for the current owner, bumping `lease_counter`.
    async fn renew_lease(&self, lease: &Lease) -> Result<Lease, StoreError>;

    /// Attempts to take over ownership of the lease for `new_owner`. A
    /// takeover starts a new ownership epoch, so implementations must assign
    /// a fresh `concurrency_token` (see `fresh_concurrency_token`) along with
    /// bumping `lease_counter`.
    async fn take_lease(&self, lease: &Lease, new_owner: &str) -> Result<Lease, StoreError>;
}
