//! Storage contract for lease records.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::LockError;
use crate::lease::{Lease, NewLease};

/// Lock store contract used by the lease manager.
///
/// Implementations are responsible for the atomicity the manager relies on:
/// - `insert` must reject a new active row when an active row for the same
///   `resource_name` already exists, enforced by the storage layer itself
///   (a uniqueness constraint or conditional write), so the loser of two
///   concurrent inserts fails deterministically with [LockError::Conflict].
/// - `deactivate` flips exactly one row or none.
/// - `sweep_expired` only ever moves rows from active to inactive and only
///   touches rows whose `expires_at <= now`.
///
/// Driver failures map to [LockError::StorageUnavailable].
pub trait LockStore: Send + Sync {
    /// Active lease for `resource_name`, if any. Logical expiry is not applied.
    fn find_active(&self, resource_name: &str) -> Result<Option<Lease>, LockError>;

    /// Every active lease, ordered by id.
    fn list_active(&self) -> Result<Vec<Lease>, LockError>;

    /// Insert a new active lease and return it with its assigned id.
    fn insert(&self, lease: NewLease) -> Result<Lease, LockError>;

    /// Deactivate the active lease matching both fields. Returns false when
    /// no such row exists.
    fn deactivate(&self, resource_name: &str, holder_id: &str) -> Result<bool, LockError>;

    /// Deactivate every active lease with `expires_at <= now`; returns rows changed.
    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, LockError>;
}

impl<S: LockStore + ?Sized> LockStore for Box<S> {
    fn find_active(&self, resource_name: &str) -> Result<Option<Lease>, LockError> {
        (**self).find_active(resource_name)
    }

    fn list_active(&self) -> Result<Vec<Lease>, LockError> {
        (**self).list_active()
    }

    fn insert(&self, lease: NewLease) -> Result<Lease, LockError> {
        (**self).insert(lease)
    }

    fn deactivate(&self, resource_name: &str, holder_id: &str) -> Result<bool, LockError> {
        (**self).deactivate(resource_name, holder_id)
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, LockError> {
        (**self).sweep_expired(now)
    }
}

impl<S: LockStore + ?Sized> LockStore for Arc<S> {
    fn find_active(&self, resource_name: &str) -> Result<Option<Lease>, LockError> {
        (**self).find_active(resource_name)
    }

    fn list_active(&self) -> Result<Vec<Lease>, LockError> {
        (**self).list_active()
    }

    fn insert(&self, lease: NewLease) -> Result<Lease, LockError> {
        (**self).insert(lease)
    }

    fn deactivate(&self, resource_name: &str, holder_id: &str) -> Result<bool, LockError> {
        (**self).deactivate(resource_name, holder_id)
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, LockError> {
        (**self).sweep_expired(now)
    }
}
