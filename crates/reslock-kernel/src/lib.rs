//! reslock kernel: named-resource leases.
//!
//! The kernel owns the lease lifecycle (acquire, release, expire) and the
//! contract a storage backend must satisfy to keep it safe under concurrent
//! requests. Transport and persistence adapters live in other crates and call
//! in through [LeaseManager].

pub mod clock;
pub mod error;
pub mod in_memory;
pub mod lease;
pub mod manager;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::LockError;
pub use in_memory::InMemoryLockStore;
pub use lease::{Lease, LeaseId, LockView, NewLease};
pub use manager::{resolve_expiry, LeaseManager};
pub use store::LockStore;
