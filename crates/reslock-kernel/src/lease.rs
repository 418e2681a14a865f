//! Lease records and the read-side view of a resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned row identifier. Strictly increasing per store.
pub type LeaseId = i64;

/// One grant of exclusive ownership over a named resource.
///
/// Rows are never deleted: releasing or expiring a lease flips `active` and
/// keeps the record as history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub resource_name: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    /// `None` means the lease never expires through TTL.
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Lease {
    /// True when `expires_at` has been reached at `now`, regardless of `active`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// True when the lease is active and not logically expired at `now`.
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired_at(now)
    }
}

/// A lease about to be inserted; the store assigns the id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewLease {
    pub resource_name: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewLease {
    pub fn into_lease(self, id: LeaseId) -> Lease {
        Lease {
            id,
            resource_name: self.resource_name,
            holder_id: self.holder_id,
            acquired_at: self.acquired_at,
            expires_at: self.expires_at,
            active: true,
        }
    }
}

/// Status of one resource as seen by readers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockView {
    pub resource_name: String,
    pub locked: bool,
    pub lease_id: Option<LeaseId>,
    pub holder_id: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockView {
    pub fn unlocked(resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            locked: false,
            lease_id: None,
            holder_id: None,
            acquired_at: None,
            expires_at: None,
        }
    }
}

impl From<&Lease> for LockView {
    fn from(lease: &Lease) -> Self {
        Self {
            resource_name: lease.resource_name.clone(),
            locked: true,
            lease_id: Some(lease.id),
            holder_id: Some(lease.holder_id.clone()),
            acquired_at: Some(lease.acquired_at),
            expires_at: lease.expires_at,
        }
    }
}

impl From<Lease> for LockView {
    fn from(lease: Lease) -> Self {
        Self::from(&lease)
    }
}
