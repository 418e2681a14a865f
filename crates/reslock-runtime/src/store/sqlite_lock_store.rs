//! SQLite-backed lock store.

#![cfg(feature = "sqlite-persistence")]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use reslock_kernel::{Lease, LockError, LockStore, NewLease};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::debug;

use super::{dt_to_ms, map_driver_err, ms_to_dt};

const SQLITE_LOCK_SCHEMA_VERSION: i64 = 2;
const SQLITE_BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(5);

const LEASE_COLUMNS: &str =
    "id, resource_name, holder_id, acquired_at_ms, expires_at_ms, active";

/// Lock store on a single SQLite connection.
///
/// Several stores (or processes) may open the same file; the partial unique
/// index on active rows keeps them mutually exclusive.
#[derive(Clone)]
pub struct SqliteLockStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLockStore {
    /// Opens (or creates) the database at `db_path`. `:memory:` is accepted.
    pub fn new(db_path: &str) -> Result<Self, LockError> {
        let conn = Connection::open(db_path)
            .map_err(|e| map_driver_err("open sqlite lock store", e))?;
        conn.busy_timeout(SQLITE_BUSY_TIMEOUT)
            .map_err(|e| map_driver_err("set sqlite busy timeout", e))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LockError> {
        self.conn
            .lock()
            .map_err(|_| LockError::storage("sqlite lock store mutex poisoned"))
    }

    fn ensure_schema(&self) -> Result<(), LockError> {
        let conn = self.conn()?;
        ensure_sqlite_migration_table(&conn)?;
        let current = sqlite_current_schema_version(&conn)?;
        if current > SQLITE_LOCK_SCHEMA_VERSION {
            return Err(LockError::storage(format!(
                "sqlite lock schema version {} is newer than supported {}",
                current, SQLITE_LOCK_SCHEMA_VERSION
            )));
        }
        if current < 1 {
            apply_sqlite_lock_migration_v1(&conn)?;
            record_sqlite_migration(&conn, 1, "baseline_resource_locks")?;
        }
        if current < 2 {
            apply_sqlite_lock_migration_v2(&conn)?;
            record_sqlite_migration(&conn, 2, "active_expiry_index")?;
        }
        Ok(())
    }

    /// Every row for `resource_name`, active or not, oldest first.
    pub fn history(&self, resource_name: &str) -> Result<Vec<Lease>, LockError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM resource_locks WHERE resource_name = ?1 ORDER BY id ASC"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| map_driver_err("prepare lease history", e))?;
        let rows = stmt
            .query_map(params![resource_name], lease_from_row)
            .map_err(|e| map_driver_err("query lease history", e))?;
        let leases = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_driver_err("read lease history", e))?;
        Ok(leases)
    }
}

impl LockStore for SqliteLockStore {
    fn find_active(&self, resource_name: &str) -> Result<Option<Lease>, LockError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM resource_locks WHERE resource_name = ?1 AND active = 1"
        );
        conn.query_row(&sql, params![resource_name], lease_from_row)
            .optional()
            .map_err(|e| map_driver_err("find active lease", e))
    }

    fn list_active(&self) -> Result<Vec<Lease>, LockError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {LEASE_COLUMNS} FROM resource_locks WHERE active = 1 ORDER BY id ASC");
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| map_driver_err("prepare list active leases", e))?;
        let rows = stmt
            .query_map([], lease_from_row)
            .map_err(|e| map_driver_err("list active leases", e))?;
        let leases = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_driver_err("read active leases", e))?;
        Ok(leases)
    }

    fn insert(&self, lease: NewLease) -> Result<Lease, LockError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO resource_locks
             (resource_name, holder_id, acquired_at_ms, expires_at_ms, active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![
                lease.resource_name,
                lease.holder_id,
                dt_to_ms(lease.acquired_at),
                lease.expires_at.map(dt_to_ms)
            ],
        );
        match inserted {
            Ok(_) => Ok(lease.into_lease(conn.last_insert_rowid())),
            Err(e) if is_unique_violation(&e) => {
                let holder = conn
                    .query_row(
                        "SELECT holder_id FROM resource_locks
                         WHERE resource_name = ?1 AND active = 1",
                        params![lease.resource_name],
                        |r| r.get::<_, String>(0),
                    )
                    .optional()
                    .map_err(|e| map_driver_err("read conflicting holder", e))?;
                Err(LockError::conflict(lease.resource_name, holder))
            }
            Err(e) => Err(map_driver_err("insert lease", e)),
        }
    }

    fn deactivate(&self, resource_name: &str, holder_id: &str) -> Result<bool, LockError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE resource_locks SET active = 0
                 WHERE resource_name = ?1 AND holder_id = ?2 AND active = 1",
                params![resource_name, holder_id],
            )
            .map_err(|e| map_driver_err("deactivate lease", e))?;
        Ok(updated > 0)
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, LockError> {
        let conn = self.conn()?;
        let swept = conn
            .execute(
                "UPDATE resource_locks SET active = 0
                 WHERE active = 1 AND expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
                params![dt_to_ms(now)],
            )
            .map_err(|e| map_driver_err("sweep expired leases", e))?;
        if swept > 0 {
            debug!(swept, "sqlite lock store deactivated expired leases");
        }
        Ok(swept as u64)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        }
        _ => false,
    }
}

fn lease_from_row(row: &Row<'_>) -> rusqlite::Result<Lease> {
    Ok(Lease {
        id: row.get(0)?,
        resource_name: row.get(1)?,
        holder_id: row.get(2)?,
        acquired_at: ms_to_dt(row.get(3)?),
        expires_at: row.get::<_, Option<i64>>(4)?.map(ms_to_dt),
        active: row.get::<_, i64>(5)? != 0,
    })
}

fn ensure_sqlite_migration_table(conn: &Connection) -> Result<(), LockError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS lock_schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| map_driver_err("init sqlite lock migration table", e))
}

fn sqlite_current_schema_version(conn: &Connection) -> Result<i64, LockError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM lock_schema_migrations",
        [],
        |r| r.get(0),
    )
    .map_err(|e| map_driver_err("read sqlite lock schema version", e))
}

fn record_sqlite_migration(conn: &Connection, version: i64, name: &str) -> Result<(), LockError> {
    let now = dt_to_ms(Utc::now());
    conn.execute(
        "INSERT OR IGNORE INTO lock_schema_migrations(version, name, applied_at_ms)
         VALUES (?1, ?2, ?3)",
        params![version, name, now],
    )
    .map_err(|e| map_driver_err("record sqlite lock migration", e))?;
    Ok(())
}

fn apply_sqlite_lock_migration_v1(conn: &Connection) -> Result<(), LockError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS resource_locks (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          resource_name TEXT NOT NULL,
          holder_id TEXT NOT NULL,
          acquired_at_ms INTEGER NOT NULL,
          expires_at_ms INTEGER NULL,
          active INTEGER NOT NULL DEFAULT 1,
          CHECK (expires_at_ms IS NULL OR expires_at_ms > acquired_at_ms)
        );
        CREATE UNIQUE INDEX IF NOT EXISTS uq_resource_locks_active_name
          ON resource_locks(resource_name) WHERE active = 1;
        "#,
    )
    .map_err(|e| map_driver_err("apply sqlite lock migration v1", e))
}

fn apply_sqlite_lock_migration_v2(conn: &Connection) -> Result<(), LockError> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_resource_locks_active_expiry
          ON resource_locks(expires_at_ms) WHERE active = 1;
        "#,
    )
    .map_err(|e| map_driver_err("apply sqlite lock migration v2", e))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use chrono::{Duration, Utc};
    use reslock_kernel::{Lease, LeaseManager, LockError, LockStore, NewLease};
    use rusqlite::Connection;

    use super::{SqliteLockStore, SQLITE_LOCK_SCHEMA_VERSION};
    use crate::store::tests::{assert_lock_store_contract, ContractHarness};

    impl ContractHarness for SqliteLockStore {
        fn rows_for(&self, resource_name: &str) -> Vec<Lease> {
            self.history(resource_name).expect("sqlite history")
        }
    }

    fn temp_sqlite_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("reslock-{}-{}.db", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn lock_store_contract_sqlite() {
        let store = SqliteLockStore::new(":memory:").expect("sqlite store");
        assert_lock_store_contract(&store, "sqlite");
    }

    #[test]
    fn schema_init_reaches_latest_version_and_is_reopenable() {
        let path = temp_sqlite_path("schema");
        let path_str = path.to_string_lossy().to_string();
        {
            let store = SqliteLockStore::new(&path_str).expect("create store");
            store
                .insert(NewLease {
                    resource_name: "persisted".into(),
                    holder_id: "proc-A".into(),
                    acquired_at: Utc::now(),
                    expires_at: None,
                })
                .expect("insert");
        }

        let reopened = SqliteLockStore::new(&path_str).expect("reopen store");
        let lease = reopened
            .find_active("persisted")
            .expect("find")
            .expect("lease survives reopen");
        assert_eq!(lease.holder_id, "proc-A");

        let conn = Connection::open(&path).expect("open sqlite db");
        let version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM lock_schema_migrations",
                [],
                |r| r.get(0),
            )
            .expect("read version");
        assert_eq!(version, SQLITE_LOCK_SCHEMA_VERSION);

        drop(conn);
        drop(reopened);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let path = temp_sqlite_path("future-schema");
        let path_str = path.to_string_lossy().to_string();
        drop(SqliteLockStore::new(&path_str).expect("create store"));
        {
            let conn = Connection::open(&path).expect("open sqlite db");
            conn.execute(
                "INSERT INTO lock_schema_migrations(version, name, applied_at_ms) VALUES (99, 'future', 0)",
                [],
            )
            .expect("insert future version");
        }
        let err = SqliteLockStore::new(&path_str)
            .err()
            .expect("future schema must be rejected");
        assert!(matches!(err, LockError::StorageUnavailable(_)));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn separate_connections_are_mutually_exclusive() {
        let path = temp_sqlite_path("two-connections");
        let path_str = path.to_string_lossy().to_string();
        let a = SqliteLockStore::new(&path_str).expect("store a");
        let b = SqliteLockStore::new(&path_str).expect("store b");

        let now = Utc::now();
        a.insert(NewLease {
            resource_name: "shared".into(),
            holder_id: "proc-A".into(),
            acquired_at: now,
            expires_at: Some(now + Duration::seconds(30)),
        })
        .expect("insert via a");

        let err = b
            .insert(NewLease {
                resource_name: "shared".into(),
                holder_id: "proc-B".into(),
                acquired_at: now,
                expires_at: None,
            })
            .expect_err("insert via b must conflict");
        assert_eq!(
            err,
            LockError::conflict("shared", Some("proc-A".to_string()))
        );

        drop(a);
        drop(b);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn concurrent_managers_on_one_file_grant_once() {
        let path = temp_sqlite_path("concurrent");
        let path_str = path.to_string_lossy().to_string();
        drop(SqliteLockStore::new(&path_str).expect("init schema"));

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let barrier = Arc::clone(&barrier);
                let path_str = path_str.clone();
                thread::spawn(move || {
                    let manager =
                        LeaseManager::new(SqliteLockStore::new(&path_str).expect("open store"));
                    barrier.wait();
                    manager.acquire("db-migration", &format!("proc-{i}"), Some(60))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LockError::Conflict { .. })));

        let _ = fs::remove_file(path);
    }
}
