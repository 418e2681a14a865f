//! Error taxonomy shared by lock stores and the lease manager.

use thiserror::Error;

/// Failure outcomes of a lock operation.
///
/// Every store and manager operation returns these synchronously; nothing in
/// the kernel retries or logs them.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LockError {
    /// The resource is actively held, or a concurrent acquirer won the insert.
    ///
    /// `holder_id` is the current holder when it could be determined.
    #[error("resource '{resource_name}' is already locked{}", held_by(.holder_id))]
    Conflict {
        resource_name: String,
        holder_id: Option<String>,
    },
    /// No active lease exists for this resource and holder pair.
    #[error("no active lock found for resource '{resource_name}' by process '{holder_id}'")]
    NotFound {
        resource_name: String,
        holder_id: String,
    },
    /// The storage backend could not complete a read or write.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl LockError {
    pub fn conflict(resource_name: impl Into<String>, holder_id: Option<String>) -> Self {
        Self::Conflict {
            resource_name: resource_name.into(),
            holder_id,
        }
    }

    pub fn not_found(resource_name: impl Into<String>, holder_id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_name: resource_name.into(),
            holder_id: holder_id.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageUnavailable(message.into())
    }
}

fn held_by(holder_id: &Option<String>) -> String {
    match holder_id {
        Some(holder) => format!(" by process '{}'", holder),
        None => String::new(),
    }
}
