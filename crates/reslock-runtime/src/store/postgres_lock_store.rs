//! Postgres-backed lock store.
//!
//! This module is feature-gated behind `kernel-postgres`.

#![cfg(feature = "kernel-postgres")]

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use reslock_kernel::{Lease, LockError, LockStore, NewLease};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;

use super::{dt_to_ms, map_driver_err, ms_to_dt};

const LEASE_COLUMNS: &str =
    "id, resource_name, holder_id, acquired_at_ms, expires_at_ms, active";

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn new_db_runtime() -> Result<Arc<tokio::runtime::Runtime>, String> {
    static DB_RT: OnceLock<Result<Arc<tokio::runtime::Runtime>, String>> = OnceLock::new();
    DB_RT
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(1)
                .thread_name("reslock-pg")
                .build()
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .clone()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn lease_from_row(row: &PgRow) -> Lease {
    Lease {
        id: row.get::<i64, _>(0),
        resource_name: row.get::<String, _>(1),
        holder_id: row.get::<String, _>(2),
        acquired_at: ms_to_dt(row.get::<i64, _>(3)),
        expires_at: row.get::<Option<i64>, _>(4).map(ms_to_dt),
        active: row.get::<bool, _>(5),
    }
}

/// Lock store on a Postgres table.
///
/// Calls are synchronous: each one blocks on a small dedicated runtime, so it
/// must not be invoked from inside an async task (use `spawn_blocking`).
#[derive(Clone)]
pub struct PostgresLockStore {
    pool: Option<PgPool>,
    schema: String,
    init_error: Option<String>,
    db_runtime: Option<Arc<tokio::runtime::Runtime>>,
    schema_ready: Arc<OnceLock<Result<(), String>>>,
}

impl PostgresLockStore {
    pub fn new(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into();
        let db_runtime = new_db_runtime().ok();
        // Pool maintenance tasks are spawned onto the store's own runtime.
        let pool = db_runtime.as_ref().and_then(|rt| {
            let _guard = rt.enter();
            PgPoolOptions::new()
                .max_connections(5)
                .connect_lazy(&database_url)
                .ok()
        });
        let init_error = if pool.is_some() {
            None
        } else {
            Some("failed to initialize lazy postgres lock pool".to_string())
        };

        Self {
            pool,
            schema: "public".to_string(),
            init_error,
            db_runtime,
            schema_ready: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            schema: "public".to_string(),
            init_error: None,
            db_runtime: new_db_runtime().ok(),
            schema_ready: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self.schema_ready = Arc::new(OnceLock::new());
        self
    }

    fn runtime(&self) -> Result<&tokio::runtime::Runtime, LockError> {
        if let Some(err) = &self.init_error {
            return Err(map_driver_err("postgres init error", err));
        }
        self.db_runtime
            .as_deref()
            .ok_or_else(|| map_driver_err("runtime not available", "no db runtime"))
    }

    fn pool(&self) -> Result<&PgPool, LockError> {
        self.pool
            .as_ref()
            .ok_or_else(|| map_driver_err("pool not available", "no postgres pool"))
    }

    fn table(&self) -> String {
        format!("\"{}\".resource_locks", self.schema)
    }

    fn ensure_schema(&self) -> Result<(), LockError> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(map_driver_err("invalid schema", &self.schema));
        }

        let result = self.schema_ready.get_or_init(|| {
            let table = self.table();
            let sql_schema = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema);
            let sql_locks = format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id BIGSERIAL PRIMARY KEY,
                    resource_name TEXT NOT NULL,
                    holder_id TEXT NOT NULL,
                    acquired_at_ms BIGINT NOT NULL,
                    expires_at_ms BIGINT NULL,
                    active BOOLEAN NOT NULL DEFAULT TRUE,
                    CHECK (expires_at_ms IS NULL OR expires_at_ms > acquired_at_ms)
                )"
            );
            let sql_active_idx = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS uq_resource_locks_active_name
                 ON {table}(resource_name) WHERE active"
            );
            let sql_expiry_idx = format!(
                "CREATE INDEX IF NOT EXISTS idx_resource_locks_active_expiry
                 ON {table}(expires_at_ms) WHERE active"
            );

            let pool = match self.pool() {
                Ok(p) => p.clone(),
                Err(e) => return Err(e.to_string()),
            };
            let rt = match self.runtime() {
                Ok(r) => r,
                Err(e) => return Err(e.to_string()),
            };

            rt.block_on(async {
                sqlx::query(&sql_schema).execute(&pool).await?;
                sqlx::query(&sql_locks).execute(&pool).await?;
                sqlx::query(&sql_active_idx).execute(&pool).await?;
                sqlx::query(&sql_expiry_idx).execute(&pool).await?;
                Ok::<(), sqlx::Error>(())
            })
            .map_err(|e| e.to_string())
        });

        result
            .clone()
            .map_err(|e| map_driver_err("schema bootstrap", e))
    }

    /// Every row for `resource_name`, active or not, oldest first.
    pub fn history(&self, resource_name: &str) -> Result<Vec<Lease>, LockError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM {} WHERE resource_name = $1 ORDER BY id ASC",
            self.table()
        );
        rt.block_on(async move {
            let rows = sqlx::query(&sql)
                .bind(resource_name)
                .fetch_all(&pool)
                .await
                .map_err(|e| map_driver_err("query lease history", e))?;
            Ok(rows.iter().map(lease_from_row).collect())
        })
    }
}

impl LockStore for PostgresLockStore {
    fn find_active(&self, resource_name: &str) -> Result<Option<Lease>, LockError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM {} WHERE resource_name = $1 AND active",
            self.table()
        );
        rt.block_on(async move {
            let row = sqlx::query(&sql)
                .bind(resource_name)
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_driver_err("find active lease", e))?;
            Ok(row.as_ref().map(lease_from_row))
        })
    }

    fn list_active(&self) -> Result<Vec<Lease>, LockError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM {} WHERE active ORDER BY id ASC",
            self.table()
        );
        rt.block_on(async move {
            let rows = sqlx::query(&sql)
                .fetch_all(&pool)
                .await
                .map_err(|e| map_driver_err("list active leases", e))?;
            Ok(rows.iter().map(lease_from_row).collect())
        })
    }

    fn insert(&self, lease: NewLease) -> Result<Lease, LockError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let table = self.table();
        rt.block_on(async move {
            let insert_sql = format!(
                "INSERT INTO {table}
                 (resource_name, holder_id, acquired_at_ms, expires_at_ms, active)
                 VALUES ($1, $2, $3, $4, TRUE)
                 RETURNING id"
            );
            let inserted = sqlx::query_scalar::<_, i64>(&insert_sql)
                .bind(&lease.resource_name)
                .bind(&lease.holder_id)
                .bind(dt_to_ms(lease.acquired_at))
                .bind(lease.expires_at.map(dt_to_ms))
                .fetch_one(&pool)
                .await;

            match inserted {
                Ok(id) => Ok(lease.into_lease(id)),
                Err(e) if is_unique_violation(&e) => {
                    let holder_sql = format!(
                        "SELECT holder_id FROM {table} WHERE resource_name = $1 AND active"
                    );
                    let holder = sqlx::query_scalar::<_, String>(&holder_sql)
                        .bind(&lease.resource_name)
                        .fetch_optional(&pool)
                        .await
                        .map_err(|e| map_driver_err("read conflicting holder", e))?;
                    Err(LockError::conflict(lease.resource_name, holder))
                }
                Err(e) => Err(map_driver_err("insert lease", e)),
            }
        })
    }

    fn deactivate(&self, resource_name: &str, holder_id: &str) -> Result<bool, LockError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "UPDATE {} SET active = FALSE
             WHERE resource_name = $1 AND holder_id = $2 AND active",
            self.table()
        );
        rt.block_on(async move {
            let updated = sqlx::query(&sql)
                .bind(resource_name)
                .bind(holder_id)
                .execute(&pool)
                .await
                .map_err(|e| map_driver_err("deactivate lease", e))?
                .rows_affected();
            Ok(updated > 0)
        })
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, LockError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "UPDATE {} SET active = FALSE
             WHERE active AND expires_at_ms IS NOT NULL AND expires_at_ms <= $1",
            self.table()
        );
        let now_ms = dt_to_ms(now);
        let swept = rt.block_on(async move {
            sqlx::query(&sql)
                .bind(now_ms)
                .execute(&pool)
                .await
                .map_err(|e| map_driver_err("sweep expired leases", e))
                .map(|r| r.rows_affected())
        })?;
        if swept > 0 {
            debug!(swept, "postgres lock store deactivated expired leases");
        }
        Ok(swept)
    }
}
