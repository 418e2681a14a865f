//! Server configuration from command-line flags and environment.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use reslock_runtime::{BackendError, StoreBackend, SweepConfig};

#[derive(Clone, Debug, Parser)]
#[command(name = "reslock-server")]
#[command(version, about = "Exclusive named-resource leases over HTTP", long_about = None)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    #[arg(long, env = "RESLOCK_SERVER_ADDR", default_value = "0.0.0.0:8000")]
    pub addr: SocketAddr,

    /// Lock store URL: `memory://`, `sqlite://<path>`, `sqlite::memory:` or `postgres://...`.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./resource_locks.db")]
    pub database_url: String,

    /// Background sweep interval in milliseconds; 0 disables the sweeper.
    #[arg(long, env = "RESLOCK_SWEEP_INTERVAL_MS", default_value_t = 30_000)]
    pub sweep_interval_ms: u64,

    /// Upper bound accepted for `ttl_seconds` on lock requests.
    #[arg(long, env = "RESLOCK_MAX_TTL_SECONDS")]
    pub max_ttl_seconds: Option<i64>,
}

impl ServerConfig {
    pub fn backend(&self) -> Result<StoreBackend, BackendError> {
        StoreBackend::from_url(&self.database_url)
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }
}
