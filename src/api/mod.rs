// HTTP API: application lifecycle, sensors, effectors and tasks

mod applications;
mod effectors;

pub use applications::create_application_router;
pub use effectors::create_effector_router;

use crate::app::ApplicationRegistry;
use crate::management::ManagementContext;
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Shared state for all API handlers
#[derive(Clone)]
pub struct ApiState {
    pub mgmt: Arc<ManagementContext>,
    pub registry: Arc<ApplicationRegistry>,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Every API route, with permissive CORS
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .merge(create_application_router(state.clone()))
        .merge(create_effector_router(state))
        .layer(CorsLayer::permissive())
}
