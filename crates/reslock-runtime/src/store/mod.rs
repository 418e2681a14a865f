//! Persistent [LockStore](reslock_kernel::LockStore) implementations.
//!
//! Both SQL stores keep one table, `resource_locks`, with a partial unique
//! index on `resource_name` over active rows. That index is what makes the
//! manager's check-then-insert safe across connections.

pub mod postgres_lock_store;
pub mod sqlite_lock_store;

#[cfg(any(feature = "sqlite-persistence", feature = "kernel-postgres"))]
use chrono::{DateTime, TimeZone, Utc};
#[cfg(any(feature = "sqlite-persistence", feature = "kernel-postgres"))]
use reslock_kernel::LockError;

#[cfg(any(feature = "sqlite-persistence", feature = "kernel-postgres"))]
pub(crate) fn map_driver_err(prefix: &str, e: impl std::fmt::Display) -> LockError {
    LockError::StorageUnavailable(format!("{prefix}: {e}"))
}

#[cfg(any(feature = "sqlite-persistence", feature = "kernel-postgres"))]
pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

#[cfg(any(feature = "sqlite-persistence", feature = "kernel-postgres"))]
pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}
