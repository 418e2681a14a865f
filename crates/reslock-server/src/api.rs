//! Lock endpoints: request and response bodies, handlers and the router.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use reslock_kernel::{Lease, LeaseId, LockView};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

/// Envelope shared by every lock endpoint, success or failure.
#[derive(Clone, Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn ok(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            data: Some(data),
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LockRequest {
    pub resource_name: String,
    pub process_id: String,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReleaseQuery {
    pub resource_name: String,
    pub process_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StatusQuery {
    pub resource_name: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct LockGrant {
    pub lock_id: LeaseId,
    pub resource_name: String,
    pub process_id: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<Lease> for LockGrant {
    fn from(lease: Lease) -> Self {
        Self {
            lock_id: lease.id,
            resource_name: lease.resource_name,
            process_id: lease.holder_id,
            locked_at: lease.acquired_at,
            expires_at: lease.expires_at,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ReleaseReceipt {
    pub resource_name: String,
    pub process_id: String,
    pub released_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LockStatus {
    pub resource_name: String,
    pub is_locked: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<LockView> for LockStatus {
    fn from(view: LockView) -> Self {
        Self {
            resource_name: view.resource_name,
            is_locked: view.locked,
            locked_by: view.holder_id,
            locked_at: view.acquired_at,
            expires_at: view.expires_at,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LockedResource {
    pub id: Option<LeaseId>,
    pub resource_name: String,
    pub process_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<LockView> for LockedResource {
    fn from(view: LockView) -> Self {
        Self {
            id: view.lease_id,
            resource_name: view.resource_name,
            process_id: view.holder_id,
            locked_at: view.acquired_at,
            expires_at: view.expires_at,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LockedResources {
    pub total_locks: usize,
    pub locks: Vec<LockedResource>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/locks/request", post(request_lock))
        .route("/locks/release", delete(release_lock))
        .route("/locks/status", get(lock_status))
        .route("/locks/all-locked", get(all_locked))
        .with_state(state)
}

fn require(field: &str, value: String) -> Result<String, ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::invalid(format!("{field} must not be empty")));
    }
    Ok(value)
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({"status": "healthy", "service": "Resource Lock Manager"})),
    )
}

async fn request_lock(
    State(state): State<AppState>,
    Json(request): Json<LockRequest>,
) -> Result<Json<ApiResponse<LockGrant>>, ApiError> {
    let resource_name = require("resource_name", request.resource_name)?;
    let process_id = require("process_id", request.process_id)?;
    let ttl_seconds = request.ttl_seconds;
    state.check_ttl(ttl_seconds)?;

    let lease = state
        .run(move |m| m.acquire(&resource_name, &process_id, ttl_seconds))
        .await?;
    info!(
        resource_name = %lease.resource_name,
        process_id = %lease.holder_id,
        lock_id = lease.id,
        "lock acquired"
    );
    let message = format!(
        "Lock acquired successfully for resource '{}'",
        lease.resource_name
    );
    Ok(ApiResponse::ok(message, LockGrant::from(lease)))
}

async fn release_lock(
    State(state): State<AppState>,
    Query(query): Query<ReleaseQuery>,
) -> Result<Json<ApiResponse<ReleaseReceipt>>, ApiError> {
    let resource_name = require("resource_name", query.resource_name)?;
    let process_id = require("process_id", query.process_id)?;

    let (name, holder) = (resource_name.clone(), process_id.clone());
    let released_at = state.run(move |m| m.release(&name, &holder)).await?;
    info!(%resource_name, %process_id, "lock released");
    let message = format!("Lock released successfully for resource '{resource_name}'");
    Ok(ApiResponse::ok(
        message,
        ReleaseReceipt {
            resource_name,
            process_id,
            released_at,
        },
    ))
}

async fn lock_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<ApiResponse<LockStatus>>, ApiError> {
    let resource_name = require("resource_name", query.resource_name)?;
    let view = state.run(move |m| m.status(&resource_name)).await?;
    let message = if view.locked {
        format!(
            "Resource '{}' status retrieved successfully",
            view.resource_name
        )
    } else {
        format!("Resource '{}' is not locked", view.resource_name)
    };
    Ok(ApiResponse::ok(message, LockStatus::from(view)))
}

async fn all_locked(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<LockedResources>>, ApiError> {
    let views = state.run(|m| m.list_active()).await?;
    let locks: Vec<LockedResource> = views.into_iter().map(LockedResource::from).collect();
    let message = format!("Retrieved {} active locks", locks.len());
    Ok(ApiResponse::ok(
        message,
        LockedResources {
            total_locks: locks.len(),
            locks,
        },
    ))
}
