// Integration tests for the application, sensor, effector and task routes

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use steward::api::{create_router, ApiState};
use steward::app::ApplicationRegistry;
use steward::config::StewardConfig;
use steward::management::ManagementContext;
use tower::ServiceExt;

fn create_test_app() -> (Router, Arc<ApplicationRegistry>) {
    let mgmt = ManagementContext::new(StewardConfig::default());
    let registry = Arc::new(ApplicationRegistry::new(Arc::clone(&mgmt)));
    let router = create_router(ApiState {
        mgmt,
        registry: Arc::clone(&registry),
    });
    (router, registry)
}

fn redis_spec() -> Value {
    json!({
        "name": "redis-app",
        "entities": [{
            "name": "redis-ent",
            "type": "redis-store",
            "config": {"sensors": {"redis.port": 6379}}
        }],
        "locations": ["/locations/0"]
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Response<Body> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

async fn body_text(response: Response<Body>) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

async fn wait_for_status(app: &Router, uri: &str, expected: &str) {
    for _ in 0..200 {
        let response = send(app, "GET", uri, None).await;
        if response.status() == StatusCode::OK && body_json(response).await["status"] == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached {}", uri, expected);
}

async fn wait_for_not_found(app: &Router, uri: &str) {
    for _ in 0..200 {
        if send(app, "GET", uri, None).await.status() == StatusCode::NOT_FOUND {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} still found", uri);
}

/// GET on an application that was never deployed is 404
#[tokio::test]
async fn test_get_undefined_application() {
    let (app, _) = create_test_app();
    let response = send(&app, "GET", "/applications/dummy-not-found", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Deploy, read sensors, delete: the whole application lifecycle over HTTP
#[tokio::test]
async fn test_deploy_read_sensors_and_delete() {
    let (app, registry) = create_test_app();

    let response = send(&app, "POST", "/applications", Some(redis_spec())).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "/applications/redis-app"
    );
    assert_eq!(registry.len(), 1);

    wait_for_status(&app, "/applications/redis-app", "RUNNING").await;

    let listed = body_json(send(&app, "GET", "/applications", None).await).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["spec"], redis_spec());

    let sensors = body_json(send(&app, "GET", "/applications/redis-app/sensors", None).await).await;
    let uris: Vec<String> = serde_json::from_value(sensors["redis-ent"].clone()).unwrap();
    assert!(uris.contains(&"/applications/redis-app/sensors/redis-ent/service.state".to_string()));
    assert!(uris.contains(&"/applications/redis-app/sensors/redis-ent/redis.port".to_string()));

    let state = send(&app, "GET", "/applications/redis-app/sensors/redis-ent/service.state", None).await;
    assert_eq!(body_text(state).await, "running");
    let port = send(&app, "GET", "/applications/redis-app/sensors/redis-ent/redis.port", None).await;
    assert_eq!(body_text(port).await, "6379");

    let response = send(&app, "DELETE", "/applications/redis-app", None).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    wait_for_not_found(&app, "/applications/redis-app").await;
    let state = send(&app, "GET", "/applications/redis-app/sensors/redis-ent/service.state", None).await;
    assert_eq!(state.status(), StatusCode::NOT_FOUND);
    assert_eq!(registry.len(), 0);
}

/// Deploying the same name twice conflicts; malformed specs are rejected
#[tokio::test]
async fn test_deploy_conflicts_and_validation() {
    let (app, _) = create_test_app();

    assert_eq!(
        send(&app, "POST", "/applications", Some(redis_spec())).await.status(),
        StatusCode::CREATED
    );
    assert_eq!(
        send(&app, "POST", "/applications", Some(redis_spec())).await.status(),
        StatusCode::CONFLICT
    );

    let duplicate_entities = json!({
        "name": "dup",
        "entities": [{"name": "a", "type": "basic"}, {"name": "a", "type": "basic"}]
    });
    let response = send(&app, "POST", "/applications", Some(duplicate_entities)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("duplicate entity name"));
}

/// Effector invocation returns a task that can be polled to completion
#[tokio::test]
async fn test_invoke_effector_and_poll_task() {
    let (app, _) = create_test_app();
    send(&app, "POST", "/applications", Some(redis_spec())).await;
    wait_for_status(&app, "/applications/redis-app", "RUNNING").await;

    let effectors = body_json(
        send(&app, "GET", "/applications/redis-app/entities/redis-ent/effectors", None).await,
    )
    .await;
    let names: Vec<&str> = effectors
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["start", "stop", "restart", "setSensor"]);

    let response = send(
        &app,
        "POST",
        "/applications/redis-app/entities/redis-ent/effectors/setSensor",
        Some(json!({"name": "redis.port", "value": 6380})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let task_id = body_json(response).await["taskId"].as_str().unwrap().to_string();

    let mut status = Value::Null;
    for _ in 0..200 {
        let task = body_json(send(&app, "GET", &format!("/tasks/{}", task_id), None).await).await;
        status = task["status"].clone();
        if status == "SUCCEEDED" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, "SUCCEEDED");

    let port = send(&app, "GET", "/applications/redis-app/sensors/redis-ent/redis.port", None).await;
    assert_eq!(body_text(port).await, "6380");
}

/// Validation failures never create a task
#[tokio::test]
async fn test_invoke_validation_errors() {
    let (app, _) = create_test_app();
    send(&app, "POST", "/applications", Some(redis_spec())).await;

    let missing = send(
        &app,
        "POST",
        "/applications/redis-app/entities/redis-ent/effectors/setSensor",
        Some(json!({"value": 1})),
    )
    .await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let unknown = send(
        &app,
        "POST",
        "/applications/redis-app/entities/redis-ent/effectors/explode",
        None,
    )
    .await;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let no_entity = send(
        &app,
        "POST",
        "/applications/redis-app/entities/ghost/effectors/start",
        None,
    )
    .await;
    assert_eq!(no_entity.status(), StatusCode::NOT_FOUND);

    let tasks = body_json(send(&app, "GET", "/tasks", None).await).await;
    assert!(tasks.as_array().unwrap().is_empty());

    let response = send(&app, "GET", "/tasks/not-a-task", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
