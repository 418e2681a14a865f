//! HTTP surface for reslock.
//!
//! Routes:
//! - `POST /locks/request`
//! - `DELETE /locks/release?resource_name=&process_id=`
//! - `GET /locks/status?resource_name=`
//! - `GET /locks/all-locked`
//! - `GET /health`

pub mod api;
pub mod config;
pub mod error;
pub mod state;

pub use api::{build_router, ApiResponse};
pub use config::ServerConfig;
pub use error::ApiError;
pub use state::{AppState, SharedManager};
