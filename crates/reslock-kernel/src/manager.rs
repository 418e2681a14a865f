//! Lease manager: the acquire/release/status state machine.
//!
//! Per resource name: `UNLOCKED -> acquire -> LOCKED -> release | ttl -> UNLOCKED`.
//! A `LOCKED` lease whose `expires_at` has passed is treated as `UNLOCKED` by
//! every path, whether or not a sweep has flipped its row yet.

use chrono::{DateTime, Duration, Utc};

use crate::clock::{Clock, SystemClock};
use crate::error::LockError;
use crate::lease::{Lease, LockView, NewLease};
use crate::store::LockStore;

/// Expiry for a lease granted at `now`.
///
/// Only a positive `ttl_seconds` sets an expiry. Zero, negative or absent TTL
/// means the lease never expires on its own; so does a TTL that would overflow
/// the timestamp range.
pub fn resolve_expiry(now: DateTime<Utc>, ttl_seconds: Option<i64>) -> Option<DateTime<Utc>> {
    ttl_seconds
        .filter(|secs| *secs > 0)
        .and_then(Duration::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
}

/// Stateless decision logic over a [LockStore].
///
/// Each operation takes exactly one clock reading and uses it for both the
/// expiry sweep and its own decision.
pub struct LeaseManager<S: LockStore, C: Clock = SystemClock> {
    store: S,
    clock: C,
}

impl<S: LockStore> LeaseManager<S, SystemClock> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, SystemClock::new())
    }
}

impl<S: LockStore, C: Clock> LeaseManager<S, C> {
    pub fn with_clock(store: S, clock: C) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Try once to take an exclusive lease on `resource_name`.
    pub fn acquire(
        &self,
        resource_name: &str,
        holder_id: &str,
        ttl_seconds: Option<i64>,
    ) -> Result<Lease, LockError> {
        let now = self.clock.now();
        self.store.sweep_expired(now)?;

        if let Some(existing) = self.store.find_active(resource_name)? {
            if !existing.is_expired_at(now) {
                return Err(LockError::conflict(resource_name, Some(existing.holder_id)));
            }
            // Inserted behind our sweep but already past its expiry.
            self.store.sweep_expired(now)?;
        }

        // A concurrent acquirer that wins the insert surfaces here as Conflict.
        self.store.insert(NewLease {
            resource_name: resource_name.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: resolve_expiry(now, ttl_seconds),
        })
    }

    /// Release the lease `holder_id` holds on `resource_name`.
    ///
    /// Fails with [LockError::NotFound] both when the resource is unlocked and
    /// when someone else holds it; the error never names the actual holder.
    pub fn release(&self, resource_name: &str, holder_id: &str) -> Result<DateTime<Utc>, LockError> {
        let now = self.clock.now();
        self.store.sweep_expired(now)?;
        if self.store.deactivate(resource_name, holder_id)? {
            Ok(now)
        } else {
            Err(LockError::not_found(resource_name, holder_id))
        }
    }

    pub fn status(&self, resource_name: &str) -> Result<LockView, LockError> {
        let now = self.clock.now();
        self.store.sweep_expired(now)?;
        Ok(self
            .store
            .find_active(resource_name)?
            .filter(|lease| lease.is_held_at(now))
            .map(LockView::from)
            .unwrap_or_else(|| LockView::unlocked(resource_name)))
    }

    /// Every held lease. Not paginated.
    pub fn list_active(&self) -> Result<Vec<LockView>, LockError> {
        let now = self.clock.now();
        self.store.sweep_expired(now)?;
        Ok(self
            .store
            .list_active()?
            .iter()
            .filter(|lease| lease.is_held_at(now))
            .map(LockView::from)
            .collect())
    }

    /// Run the expiry sweep on its own; returns leases deactivated.
    pub fn sweep(&self) -> Result<u64, LockError> {
        self.store.sweep_expired(self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;
    use crate::in_memory::InMemoryLockStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn manager() -> LeaseManager<InMemoryLockStore, Arc<ManualClock>> {
        LeaseManager::with_clock(InMemoryLockStore::new(), Arc::new(ManualClock::new(t0())))
    }

    #[test]
    fn acquire_with_ttl_sets_expiry() {
        let m = manager();
        let lease = m.acquire("db-migration", "proc-A", Some(60)).unwrap();
        assert!(lease.active);
        assert_eq!(lease.holder_id, "proc-A");
        assert_eq!(lease.acquired_at, t0());
        assert_eq!(lease.expires_at, Some(t0() + Duration::seconds(60)));
    }

    #[test]
    fn second_acquirer_conflicts_and_learns_holder() {
        let m = manager();
        m.acquire("db-migration", "proc-A", Some(60)).unwrap();
        let err = m.acquire("db-migration", "proc-B", None).unwrap_err();
        assert_eq!(
            err,
            LockError::conflict("db-migration", Some("proc-A".to_string()))
        );
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let m = manager();
        m.acquire("db-migration", "proc-A", Some(60)).unwrap();
        m.clock().advance(Duration::seconds(61));

        let lease = m.acquire("db-migration", "proc-B", None).unwrap();
        assert_eq!(lease.holder_id, "proc-B");

        let history = m.store().history("db-migration").unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].active);
        assert!(history[1].active);
    }

    #[test]
    fn releasing_a_superseded_lease_is_not_found() {
        let m = manager();
        m.acquire("db-migration", "proc-A", Some(60)).unwrap();
        m.clock().advance(Duration::seconds(61));
        m.acquire("db-migration", "proc-B", None).unwrap();

        let err = m.release("db-migration", "proc-A").unwrap_err();
        assert_eq!(err, LockError::not_found("db-migration", "proc-A"));
    }

    #[test]
    fn releasing_an_expired_unswept_lease_is_not_found() {
        let m = manager();
        m.acquire("job", "proc-A", Some(5)).unwrap();
        m.clock().advance(Duration::seconds(5));
        assert!(matches!(
            m.release("job", "proc-A"),
            Err(LockError::NotFound { .. })
        ));
    }

    #[test]
    fn status_of_unused_resource_is_empty() {
        let m = manager();
        assert_eq!(
            m.status("unused-resource").unwrap(),
            LockView::unlocked("unused-resource")
        );
    }

    #[test]
    fn zero_and_negative_ttl_never_expire() {
        let m = manager();
        m.acquire("r", "A", Some(0)).unwrap();
        m.acquire("s", "A", Some(-30)).unwrap();
        m.clock().advance(Duration::days(365));

        for name in ["r", "s"] {
            let view = m.status(name).unwrap();
            assert!(view.locked);
            assert_eq!(view.holder_id.as_deref(), Some("A"));
            assert!(view.expires_at.is_none());
        }
    }

    #[test]
    fn overflowing_ttl_means_no_expiry() {
        assert_eq!(resolve_expiry(t0(), Some(i64::MAX)), None);
        assert_eq!(resolve_expiry(t0(), None), None);
        assert_eq!(
            resolve_expiry(t0(), Some(1)),
            Some(t0() + Duration::seconds(1))
        );
    }

    #[test]
    fn release_by_holder_frees_the_resource() {
        let m = manager();
        m.acquire("r", "A", None).unwrap();
        m.clock().advance(Duration::seconds(3));
        let released_at = m.release("r", "A").unwrap();
        assert_eq!(released_at, t0() + Duration::seconds(3));
        assert!(!m.status("r").unwrap().locked);
        m.acquire("r", "B", None).unwrap();
    }

    #[test]
    fn release_by_wrong_holder_does_not_leak_holder() {
        let m = manager();
        m.acquire("db-migration", "proc-A", None).unwrap();
        let err = m.release("db-migration", "proc-B").unwrap_err();
        assert_eq!(err, LockError::not_found("db-migration", "proc-B"));
        assert!(!err.to_string().contains("proc-A"));
        assert!(m.status("db-migration").unwrap().locked);
    }

    #[test]
    fn list_active_excludes_expired_and_released() {
        let m = manager();
        m.acquire("a", "A", Some(10)).unwrap();
        m.acquire("b", "B", Some(100)).unwrap();
        m.acquire("c", "C", None).unwrap();
        m.release("c", "C").unwrap();
        m.clock().advance(Duration::seconds(10));

        let names: Vec<String> = m
            .list_active()
            .unwrap()
            .into_iter()
            .map(|v| v.resource_name)
            .collect();
        assert_eq!(names, vec!["b".to_string()]);
    }

    #[test]
    fn sweep_is_idempotent() {
        let m = manager();
        m.acquire("a", "A", Some(1)).unwrap();
        m.acquire("b", "B", Some(1)).unwrap();
        m.clock().advance(Duration::seconds(2));
        assert_eq!(m.sweep().unwrap(), 2);
        assert_eq!(m.sweep().unwrap(), 0);
    }

    #[test]
    fn concurrent_acquirers_have_exactly_one_winner() {
        let m = Arc::new(LeaseManager::new(InMemoryLockStore::new()));
        let threads = 32;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let m = Arc::clone(&m);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    m.acquire("shared", &format!("proc-{i}"), Some(60))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LockError::Conflict { .. })));
        assert_eq!(m.list_active().unwrap().len(), 1);
    }

    /// Store whose sweep does nothing for the first `skips` calls.
    struct LaggingStore {
        inner: InMemoryLockStore,
        skips: AtomicUsize,
    }

    impl LockStore for LaggingStore {
        fn find_active(&self, resource_name: &str) -> Result<Option<Lease>, LockError> {
            self.inner.find_active(resource_name)
        }
        fn list_active(&self) -> Result<Vec<Lease>, LockError> {
            self.inner.list_active()
        }
        fn insert(&self, lease: NewLease) -> Result<Lease, LockError> {
            self.inner.insert(lease)
        }
        fn deactivate(&self, resource_name: &str, holder_id: &str) -> Result<bool, LockError> {
            self.inner.deactivate(resource_name, holder_id)
        }
        fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, LockError> {
            let skipped = self
                .skips
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if skipped {
                Ok(0)
            } else {
                self.inner.sweep_expired(now)
            }
        }
    }

    #[test]
    fn readers_treat_unswept_expired_lease_as_unlocked() {
        let store = LaggingStore {
            inner: InMemoryLockStore::new(),
            skips: AtomicUsize::new(0),
        };
        let m = LeaseManager::with_clock(store, Arc::new(ManualClock::new(t0())));
        m.acquire("r", "A", Some(30)).unwrap();
        m.clock().advance(Duration::seconds(30));
        m.store().skips.store(2, Ordering::SeqCst);

        assert!(!m.status("r").unwrap().locked);
        assert!(m.list_active().unwrap().is_empty());
        assert!(m.store().inner.find_active("r").unwrap().is_some());
    }

    #[test]
    fn acquire_reconciles_expired_lease_the_sweep_missed() {
        let store = LaggingStore {
            inner: InMemoryLockStore::new(),
            skips: AtomicUsize::new(0),
        };
        let m = LeaseManager::with_clock(store, Arc::new(ManualClock::new(t0())));
        m.acquire("r", "A", Some(30)).unwrap();
        m.clock().advance(Duration::seconds(31));
        m.store().skips.store(1, Ordering::SeqCst);

        let lease = m.acquire("r", "B", None).unwrap();
        assert_eq!(lease.holder_id, "B");
    }

    /// Store that hides active rows from lookups, as if a concurrent
    /// acquirer inserted between our check and our insert.
    struct RacingStore(InMemoryLockStore);

    impl LockStore for RacingStore {
        fn find_active(&self, _resource_name: &str) -> Result<Option<Lease>, LockError> {
            Ok(None)
        }
        fn list_active(&self) -> Result<Vec<Lease>, LockError> {
            self.0.list_active()
        }
        fn insert(&self, lease: NewLease) -> Result<Lease, LockError> {
            self.0.insert(lease)
        }
        fn deactivate(&self, resource_name: &str, holder_id: &str) -> Result<bool, LockError> {
            self.0.deactivate(resource_name, holder_id)
        }
        fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, LockError> {
            self.0.sweep_expired(now)
        }
    }

    #[test]
    fn lost_insert_race_is_a_conflict_without_retry() {
        let m = LeaseManager::with_clock(
            RacingStore(InMemoryLockStore::new()),
            Arc::new(ManualClock::new(t0())),
        );
        m.acquire("r", "A", None).unwrap();
        let err = m.acquire("r", "B", None).unwrap_err();
        assert_eq!(err, LockError::conflict("r", Some("A".to_string())));
        assert_eq!(m.store().0.history("r").unwrap().len(), 1);
    }

    struct UnavailableStore;

    impl LockStore for UnavailableStore {
        fn find_active(&self, _resource_name: &str) -> Result<Option<Lease>, LockError> {
            Err(LockError::storage("down"))
        }
        fn list_active(&self) -> Result<Vec<Lease>, LockError> {
            Err(LockError::storage("down"))
        }
        fn insert(&self, _lease: NewLease) -> Result<Lease, LockError> {
            Err(LockError::storage("down"))
        }
        fn deactivate(&self, _resource_name: &str, _holder_id: &str) -> Result<bool, LockError> {
            Err(LockError::storage("down"))
        }
        fn sweep_expired(&self, _now: DateTime<Utc>) -> Result<u64, LockError> {
            Err(LockError::storage("down"))
        }
    }

    #[test]
    fn storage_failures_propagate_unchanged() {
        let m = LeaseManager::new(UnavailableStore);
        assert_eq!(
            m.acquire("r", "A", None).unwrap_err(),
            LockError::storage("down")
        );
        assert_eq!(m.release("r", "A").unwrap_err(), LockError::storage("down"));
        assert_eq!(m.status("r").unwrap_err(), LockError::storage("down"));
        assert_eq!(m.list_active().unwrap_err(), LockError::storage("down"));
    }
}
