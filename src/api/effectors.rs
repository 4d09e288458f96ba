use crate::api::{ApiState, ErrorResponse};
use crate::app::DeployError;
use crate::effector::{EffectorError, EffectorSpec, Params, TaskSummary};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tracing::info;

/// Response for an accepted effector invocation
#[derive(Serialize)]
pub struct InvokeResponse {
    #[serde(rename = "taskId")]
    pub task_id: String,
}

/// Create the effector and task router
pub fn create_effector_router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/applications/:app/entities/:entity/effectors",
            get(list_effectors),
        )
        .route(
            "/applications/:app/entities/:entity/effectors/:effector",
            axum::routing::post(invoke_effector),
        )
        .route("/tasks", get(list_tasks))
        .route("/tasks/:id", get(get_task))
        .with_state(state)
}

/// GET /applications/:app/entities/:entity/effectors
async fn list_effectors(
    State(state): State<ApiState>,
    Path((app, entity)): Path<(String, String)>,
) -> Result<Json<Vec<EffectorSpec>>, EffectorApiError> {
    let id = state.registry.entity_id(&app, &entity)?;
    Ok(Json(state.mgmt.effectors(&id)?))
}

/// POST /applications/:app/entities/:entity/effectors/:effector
///
/// Body is an optional JSON object of parameters. Returns 202 with the task id;
/// the task itself runs in the background.
async fn invoke_effector(
    State(state): State<ApiState>,
    Path((app, entity, effector)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<Response, EffectorApiError> {
    let params: Params = if body.iter().all(u8::is_ascii_whitespace) {
        Params::new()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| EffectorApiError::BadBody(e.to_string()))?
    };

    let id = state.registry.entity_id(&app, &entity)?;
    let task = state.mgmt.invoke(&id, &effector, params)?;
    info!(
        entity_id = %id,
        effector = %effector,
        task_id = %task.id(),
        "Effector invoked"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(InvokeResponse {
            task_id: task.id().to_string(),
        }),
    )
        .into_response())
}

/// GET /tasks
async fn list_tasks(State(state): State<ApiState>) -> Json<Vec<TaskSummary>> {
    Json(state.mgmt.tasks().list())
}

/// GET /tasks/:id
async fn get_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<TaskSummary>, EffectorApiError> {
    state
        .mgmt
        .tasks()
        .get(&id)
        .map(|t| Json(t.summary()))
        .ok_or(EffectorApiError::TaskNotFound(id))
}

/// Effector API error types
enum EffectorApiError {
    Lookup(DeployError),
    Effector(EffectorError),
    BadBody(String),
    TaskNotFound(String),
}

impl From<DeployError> for EffectorApiError {
    fn from(e: DeployError) -> Self {
        EffectorApiError::Lookup(e)
    }
}

impl From<EffectorError> for EffectorApiError {
    fn from(e: EffectorError) -> Self {
        EffectorApiError::Effector(e)
    }
}

impl IntoResponse for EffectorApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            EffectorApiError::Lookup(e) => (StatusCode::NOT_FOUND, e.to_string()),
            EffectorApiError::Effector(e) => {
                let status = match e {
                    EffectorError::EntityNotFound(_) | EffectorError::UnknownEffector { .. } => {
                        StatusCode::NOT_FOUND
                    }
                    EffectorError::ManagementStopped => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, e.to_string())
            }
            EffectorApiError::BadBody(reason) => (
                StatusCode::BAD_REQUEST,
                format!("parameters must be a JSON object: {}", reason),
            ),
            EffectorApiError::TaskNotFound(id) => {
                (StatusCode::NOT_FOUND, format!("task '{}' not found", id))
            }
        };

        (status, Json(ErrorResponse { error: error_message })).into_response()
    }
}
