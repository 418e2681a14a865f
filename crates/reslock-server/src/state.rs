use std::sync::Arc;

use reslock_kernel::{Clock, LeaseManager, LockError, LockStore};

use crate::error::ApiError;

/// Manager type the server runs: any store, any clock.
pub type SharedManager = Arc<LeaseManager<Box<dyn LockStore>, Arc<dyn Clock>>>;

#[derive(Clone)]
pub struct AppState {
    manager: SharedManager,
    max_ttl_seconds: Option<i64>,
}

impl AppState {
    pub fn new(manager: SharedManager) -> Self {
        Self {
            manager,
            max_ttl_seconds: None,
        }
    }

    pub fn with_max_ttl_seconds(mut self, max_ttl_seconds: Option<i64>) -> Self {
        self.max_ttl_seconds = max_ttl_seconds;
        self
    }

    pub fn manager(&self) -> &SharedManager {
        &self.manager
    }

    pub fn check_ttl(&self, ttl_seconds: Option<i64>) -> Result<(), ApiError> {
        match (ttl_seconds, self.max_ttl_seconds) {
            (Some(ttl), Some(max)) if ttl > max => Err(ApiError::invalid(format!(
                "ttl_seconds {ttl} exceeds the maximum of {max}"
            ))),
            _ => Ok(()),
        }
    }

    /// Runs a manager call on the blocking pool; stores do synchronous I/O.
    pub async fn run<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&LeaseManager<Box<dyn LockStore>, Arc<dyn Clock>>) -> Result<T, LockError>
            + Send
            + 'static,
    {
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || f(&manager))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .map_err(ApiError::from)
    }
}
