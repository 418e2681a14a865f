//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use reslock_kernel::LockError;
use thiserror::Error;
use tracing::error;

use crate::api::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// - InvalidRequest: 400
    /// - Conflict: 409
    /// - NotFound: 404
    /// - StorageUnavailable, Internal: 500
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Lock(LockError::Conflict { .. }) => StatusCode::CONFLICT,
            Self::Lock(LockError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Lock(LockError::StorageUnavailable(_)) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "lock request failed");
        }
        let body: ApiResponse<()> = ApiResponse {
            success: false,
            message: self.to_string(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}
