//! Lock store selection from a database URL.

use reslock_kernel::{InMemoryLockStore, LockError, LockStore};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported database url '{0}'")]
    UnsupportedUrl(String),
    #[error("{backend} backend requires the '{feature}' feature")]
    FeatureDisabled {
        backend: &'static str,
        feature: &'static str,
    },
    #[error(transparent)]
    Store(#[from] LockError),
}

/// Storage backend named by a database URL.
///
/// - `memory://` keeps leases in process memory.
/// - `sqlite::memory:`, `sqlite://<path>`, and the three/four-slash forms
///   `sqlite:///relative.db` / `sqlite:////abs/path.db`.
/// - `postgres://...` or `postgresql://...`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite(String),
    Postgres(String),
}

impl StoreBackend {
    pub fn from_url(url: &str) -> Result<Self, BackendError> {
        let url = url.trim();
        if url == "memory" || url.starts_with("memory:") {
            return Ok(Self::Memory);
        }
        if url == "sqlite::memory:" || url == "sqlite://:memory:" {
            return Ok(Self::Sqlite(":memory:".to_string()));
        }
        if let Some(rest) = url.strip_prefix("sqlite://") {
            // sqlite:///rel.db -> rel.db, sqlite:////abs.db -> /abs.db
            let path = rest.strip_prefix('/').unwrap_or(rest);
            if path.is_empty() {
                return Err(BackendError::UnsupportedUrl(url.to_string()));
            }
            return Ok(Self::Sqlite(path.to_string()));
        }
        if let Some(path) = url.strip_prefix("sqlite:") {
            if path.is_empty() {
                return Err(BackendError::UnsupportedUrl(url.to_string()));
            }
            return Ok(Self::Sqlite(path.to_string()));
        }
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(Self::Postgres(url.to_string()));
        }
        Err(BackendError::UnsupportedUrl(url.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite(_) => "sqlite",
            Self::Postgres(_) => "postgres",
        }
    }

    /// Opens the store. Schema bootstrap happens here for SQLite and lazily
    /// on first use for Postgres.
    pub fn open(&self) -> Result<Box<dyn LockStore>, BackendError> {
        info!(backend = self.name(), "opening lock store");
        match self {
            Self::Memory => Ok(Box::new(InMemoryLockStore::new())),
            Self::Sqlite(path) => open_sqlite(path),
            Self::Postgres(url) => open_postgres(url),
        }
    }
}

#[cfg(feature = "sqlite-persistence")]
fn open_sqlite(path: &str) -> Result<Box<dyn LockStore>, BackendError> {
    Ok(Box::new(crate::store::sqlite_lock_store::SqliteLockStore::new(path)?))
}

#[cfg(not(feature = "sqlite-persistence"))]
fn open_sqlite(_path: &str) -> Result<Box<dyn LockStore>, BackendError> {
    Err(BackendError::FeatureDisabled {
        backend: "sqlite",
        feature: "sqlite-persistence",
    })
}

#[cfg(feature = "kernel-postgres")]
fn open_postgres(url: &str) -> Result<Box<dyn LockStore>, BackendError> {
    Ok(Box::new(
        crate::store::postgres_lock_store::PostgresLockStore::new(url),
    ))
}

#[cfg(not(feature = "kernel-postgres"))]
fn open_postgres(_url: &str) -> Result<Box<dyn LockStore>, BackendError> {
    Err(BackendError::FeatureDisabled {
        backend: "postgres",
        feature: "kernel-postgres",
    })
}
