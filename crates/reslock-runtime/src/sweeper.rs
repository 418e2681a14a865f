//! Background expiry sweep.
//!
//! Readers already reconcile expired leases on every call; the sweeper only
//! keeps the stored `active` flags close to real time between requests.

use std::sync::Arc;
use std::time::Duration;

use reslock_kernel::{Clock, LeaseManager, LockError, LockStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Sweep cadence.
#[derive(Clone, Debug)]
pub struct SweepConfig {
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Result of one sweep tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepTickResult {
    pub expired: u64,
}

pub fn sweep_tick<S: LockStore, C: Clock>(
    manager: &LeaseManager<S, C>,
) -> Result<SweepTickResult, LockError> {
    let expired = manager.sweep()?;
    Ok(SweepTickResult { expired })
}

/// Running sweeper; dropping the handle also stops the task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "lease sweeper task ended abnormally");
        }
    }
}

/// Spawns the sweeper on the current tokio runtime.
///
/// Returns `None` when `config.interval` is zero (background sweep disabled).
pub fn spawn_sweeper<S, C>(
    manager: Arc<LeaseManager<S, C>>,
    config: SweepConfig,
) -> Option<SweeperHandle>
where
    S: LockStore + 'static,
    C: Clock + 'static,
{
    if config.interval.is_zero() {
        return None;
    }
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        info!(interval_ms = config.interval.as_millis() as u64, "lease sweeper started");
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // Stores block, so the sweep runs off the async workers.
            let manager = Arc::clone(&manager);
            match tokio::task::spawn_blocking(move || sweep_tick(&manager)).await {
                Ok(Ok(tick)) if tick.expired > 0 => {
                    debug!(expired = tick.expired, "lease sweeper deactivated expired leases");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "lease sweep failed"),
                Err(e) => error!(error = %e, "lease sweep task panicked"),
            }
        }
        info!("lease sweeper stopped");
    });
    Some(SweeperHandle { shutdown, task })
}
