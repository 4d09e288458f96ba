use crate::api::{ApiState, ErrorResponse};
use crate::app::{ApplicationSpec, ApplicationSummary, DeployError};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Create the application lifecycle router
pub fn create_application_router(state: ApiState) -> Router {
    Router::new()
        .route("/applications", get(list_applications).post(deploy_application))
        .route(
            "/applications/:app",
            get(get_application).delete(delete_application),
        )
        .route("/applications/:app/sensors", get(list_sensors))
        .route("/applications/:app/sensors/:entity/:sensor", get(read_sensor))
        .with_state(state)
}

/// GET /applications
async fn list_applications(State(state): State<ApiState>) -> Json<Vec<ApplicationSummary>> {
    Json(state.registry.list())
}

/// POST /applications - Deploy and start asynchronously
async fn deploy_application(
    State(state): State<ApiState>,
    Json(spec): Json<ApplicationSpec>,
) -> Result<Response, ApplicationError> {
    info!(app = %spec.name, entities = spec.entities.len(), "Deploy requested");
    let summary = state.registry.deploy(spec)?;
    let location = format!("/applications/{}", summary.spec.name);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(summary),
    )
        .into_response())
}

/// GET /applications/:app
async fn get_application(
    State(state): State<ApiState>,
    Path(app): Path<String>,
) -> Result<Json<ApplicationSummary>, ApplicationError> {
    state
        .registry
        .get(&app)
        .map(Json)
        .ok_or(ApplicationError::Deploy(DeployError::NotFound(app)))
}

/// DELETE /applications/:app - Teardown continues in the background
async fn delete_application(
    State(state): State<ApiState>,
    Path(app): Path<String>,
) -> Result<StatusCode, ApplicationError> {
    state.registry.delete(&app)?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /applications/:app/sensors - Entity name to sensor read URIs
async fn list_sensors(
    State(state): State<ApiState>,
    Path(app): Path<String>,
) -> Result<Json<BTreeMap<String, BTreeSet<String>>>, ApplicationError> {
    Ok(Json(state.registry.sensors(&app)?))
}

/// GET /applications/:app/sensors/:entity/:sensor - Value as text
async fn read_sensor(
    State(state): State<ApiState>,
    Path((app, entity, sensor)): Path<(String, String, String)>,
) -> Result<String, ApplicationError> {
    let value = state.registry.read_sensor(&app, &entity, &sensor)?;
    Ok(match value {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Application API error types
#[derive(Debug)]
enum ApplicationError {
    Deploy(DeployError),
}

impl From<DeployError> for ApplicationError {
    fn from(e: DeployError) -> Self {
        ApplicationError::Deploy(e)
    }
}

impl IntoResponse for ApplicationError {
    fn into_response(self) -> Response {
        let ApplicationError::Deploy(e) = self;
        let status = match &e {
            DeployError::AlreadyExists(_) => StatusCode::CONFLICT,
            DeployError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
            DeployError::NotFound(_)
            | DeployError::EntityNotFound { .. }
            | DeployError::SensorNotFound { .. } => StatusCode::NOT_FOUND,
            DeployError::Management(_) => {
                warn!(error = %e, "Deploy failed");
                StatusCode::BAD_REQUEST
            }
        };
        (status, Json(ErrorResponse { error: e.to_string() })).into_response()
    }
}
