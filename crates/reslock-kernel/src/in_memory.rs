//! In-memory lock store: append-only rows plus an index of active leases.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::LockError;
use crate::lease::{Lease, NewLease};
use crate::store::LockStore;

#[derive(Debug, Default)]
struct Inner {
    /// Every lease ever granted; row `i` has id `i + 1`.
    rows: Vec<Lease>,
    /// resource_name -> index into `rows` of its active lease.
    active: HashMap<String, usize>,
}

/// Lock store held in process memory.
///
/// A single mutex makes every operation atomic; the `active` index is the
/// uniqueness constraint on `(resource_name, active)`.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    inner: Mutex<Inner>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, LockError> {
        self.inner
            .lock()
            .map_err(|_| LockError::storage("in-memory lock store poisoned"))
    }

    /// All rows for a resource, active or not, oldest first.
    pub fn history(&self, resource_name: &str) -> Result<Vec<Lease>, LockError> {
        let inner = self.lock()?;
        Ok(inner
            .rows
            .iter()
            .filter(|l| l.resource_name == resource_name)
            .cloned()
            .collect())
    }
}

impl LockStore for InMemoryLockStore {
    fn find_active(&self, resource_name: &str) -> Result<Option<Lease>, LockError> {
        let inner = self.lock()?;
        Ok(inner
            .active
            .get(resource_name)
            .map(|&idx| inner.rows[idx].clone()))
    }

    fn list_active(&self) -> Result<Vec<Lease>, LockError> {
        let inner = self.lock()?;
        let mut idxs: Vec<usize> = inner.active.values().copied().collect();
        idxs.sort_unstable();
        Ok(idxs.into_iter().map(|idx| inner.rows[idx].clone()).collect())
    }

    fn insert(&self, lease: NewLease) -> Result<Lease, LockError> {
        let mut inner = self.lock()?;
        if let Some(&idx) = inner.active.get(&lease.resource_name) {
            let holder = inner.rows[idx].holder_id.clone();
            return Err(LockError::conflict(lease.resource_name, Some(holder)));
        }
        let idx = inner.rows.len();
        let lease = lease.into_lease(idx as i64 + 1);
        inner.active.insert(lease.resource_name.clone(), idx);
        inner.rows.push(lease.clone());
        Ok(lease)
    }

    fn deactivate(&self, resource_name: &str, holder_id: &str) -> Result<bool, LockError> {
        let mut inner = self.lock()?;
        let Some(&idx) = inner.active.get(resource_name) else {
            return Ok(false);
        };
        if inner.rows[idx].holder_id != holder_id {
            return Ok(false);
        }
        inner.rows[idx].active = false;
        inner.active.remove(resource_name);
        Ok(true)
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, LockError> {
        let mut inner = self.lock()?;
        let Inner { rows, active } = &mut *inner;
        let before = active.len();
        active.retain(|_, idx| {
            let lease = &mut rows[*idx];
            if lease.is_expired_at(now) {
                lease.active = false;
                false
            } else {
                true
            }
        });
        Ok((before - active.len()) as u64)
    }
}
