//! reslock runtime: persistent lock stores, backend selection and the
//! background expiry sweep.
//!
//! Storage backends are feature-gated: `sqlite-persistence` enables
//! [SqliteLockStore], `kernel-postgres` enables [PostgresLockStore]. The
//! in-memory store from `reslock-kernel` is always available.

pub mod backend;
pub mod store;
pub mod sweeper;

pub use backend::{BackendError, StoreBackend};
#[cfg(feature = "kernel-postgres")]
pub use store::postgres_lock_store::PostgresLockStore;
#[cfg(feature = "sqlite-persistence")]
pub use store::sqlite_lock_store::SqliteLockStore;
pub use sweeper::{spawn_sweeper, sweep_tick, SweepConfig, SweepTickResult, SweeperHandle};
