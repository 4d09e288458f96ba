//! Gateway admin HTTP API.
//!
//! - `GET /add?id=&endpointId=&host=&port=[&queue attributes]` - add a gateway
//! - `GET /remove?id=` - remove a gateway
//! - anything else - 404 with a usage hint
//!
//! Query parameters are declared as effector schemas so they are validated the
//! same way effector invocations on the control plane are. Every response is
//! plain text ending in a newline.

use crate::registry::GatewayChangeListener;
use crate::types::{Gateway, GatewayError, GatewayQueueAttributes};
use axum::{
    extract::{RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use steward::effector::{EffectorSpec, ParameterSpec, ParameterType, Params};
use tracing::{info, warn};

pub const ID_KEY: &str = "id";
pub const ENDPOINT_ID_KEY: &str = "endpointId";
pub const HOST_KEY: &str = "host";
pub const PORT_KEY: &str = "port";
pub const DISK_STORE_NAME_KEY: &str = "diskStoreName";
pub const MAX_QUEUE_MEMORY_KEY: &str = "maximumQueueMemory";
pub const BATCH_SIZE_KEY: &str = "batchSize";
pub const BATCH_TIME_INTERVAL_KEY: &str = "batchTimeInterval";
pub const ALERT_THRESHOLD_KEY: &str = "alertThreshold";
pub const BATCH_CONFLATION_KEY: &str = "batchConflation";
pub const ENABLE_PERSISTENCE_KEY: &str = "enablePersistence";

const USAGE: &str = "Example usage:\n\
GET http://host:port/add?id=US&endpointId=US-1&host=localhost&port=44444 \n";

/// Shared state for the admin handlers
#[derive(Clone)]
pub struct ApiState {
    pub listener: Arc<dyn GatewayChangeListener>,
}

/// Schema of `/add`
pub fn add_gateway_spec() -> EffectorSpec {
    EffectorSpec::new("addGateway", "Adds a named remote endpoint")
        .param(ParameterSpec::required(ID_KEY, ParameterType::String))
        .param(ParameterSpec::required(ENDPOINT_ID_KEY, ParameterType::String))
        .param(ParameterSpec::required(HOST_KEY, ParameterType::String))
        .param(ParameterSpec::required(PORT_KEY, ParameterType::Integer))
        .param(ParameterSpec::optional(DISK_STORE_NAME_KEY, ParameterType::String, None))
        .param(ParameterSpec::optional(MAX_QUEUE_MEMORY_KEY, ParameterType::Integer, None))
        .param(ParameterSpec::optional(BATCH_SIZE_KEY, ParameterType::Integer, None))
        .param(ParameterSpec::optional(BATCH_TIME_INTERVAL_KEY, ParameterType::Integer, None))
        .param(ParameterSpec::optional(ALERT_THRESHOLD_KEY, ParameterType::Integer, None))
        .param(ParameterSpec::optional(BATCH_CONFLATION_KEY, ParameterType::Boolean, None))
        .param(ParameterSpec::optional(ENABLE_PERSISTENCE_KEY, ParameterType::Boolean, None))
}

/// Schema of `/remove`
pub fn remove_gateway_spec() -> EffectorSpec {
    EffectorSpec::new("removeGateway", "Removes a named remote endpoint")
        .param(ParameterSpec::required(ID_KEY, ParameterType::String))
}

/// Create the admin router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/add", get(handle_add))
        .route("/remove", get(handle_remove))
        .fallback(handle_unknown)
        .with_state(state)
}

/// GET /add
async fn handle_add(
    State(state): State<ApiState>,
    RawQuery(query): RawQuery,
) -> Result<Response, GatewayError> {
    let gateway = parse_gateway(query.as_deref())?;
    let id = gateway.id.clone();
    state.listener.gateway_added(gateway);
    Ok(text(StatusCode::OK, format!("Added gateway:{}", id)))
}

/// GET /remove
async fn handle_remove(
    State(state): State<ApiState>,
    RawQuery(query): RawQuery,
) -> Result<Response, GatewayError> {
    let params = parse_params(&remove_gateway_spec(), query.as_deref())?;
    let id = string_param(&params, ID_KEY).unwrap_or_default();

    let message = if state.listener.gateway_removed(&id) {
        format!("Removed gateway:{}", id)
    } else {
        format!("Gateway {} not removed", id)
    };
    Ok(text(StatusCode::OK, message))
}

async fn handle_unknown() -> Response {
    text(StatusCode::NOT_FOUND, USAGE.to_string())
}

/// Parse an `/add` query into a gateway, assigning its overflow directory.
pub fn parse_gateway(query: Option<&str>) -> Result<Gateway, GatewayError> {
    let params = parse_params(&add_gateway_spec(), query)?;

    let port = int_param(&params, PORT_KEY).unwrap_or_default();
    let port = u16::try_from(port).map_err(|_| GatewayError::PortOutOfRange(port))?;
    let endpoint_id = string_param(&params, ENDPOINT_ID_KEY).unwrap_or_default();

    let attributes = GatewayQueueAttributes {
        disk_store_name: string_param(&params, DISK_STORE_NAME_KEY),
        maximum_queue_memory: int_param(&params, MAX_QUEUE_MEMORY_KEY).map(|n| n as i32),
        batch_size: int_param(&params, BATCH_SIZE_KEY).map(|n| n as i32),
        batch_time_interval: int_param(&params, BATCH_TIME_INTERVAL_KEY).map(|n| n as i32),
        alert_threshold: int_param(&params, ALERT_THRESHOLD_KEY).map(|n| n as i32),
        batch_conflation: params.get(BATCH_CONFLATION_KEY).and_then(Value::as_bool),
        enable_persistence: params.get(ENABLE_PERSISTENCE_KEY).and_then(Value::as_bool),
        overflow_directory: overflow_directory(&endpoint_id),
    };

    Ok(Gateway {
        id: string_param(&params, ID_KEY).unwrap_or_default(),
        endpoint_id,
        host: string_param(&params, HOST_KEY).unwrap_or_default(),
        port,
        attributes,
    })
}

/// Decode a raw query string against `spec`.
///
/// Undeclared keys are ignored. Integers must fit in 32 bits; booleans are true
/// only for a case-insensitive "true". A repeated key keeps its last value.
fn parse_params(spec: &EffectorSpec, query: Option<&str>) -> Result<Params, GatewayError> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query.unwrap_or_default())
        .map_err(|e| GatewayError::MalformedQuery(e.to_string()))?;

    let mut params = Params::new();
    for (key, raw) in pairs {
        let Some(declared) = spec.parameters.iter().find(|p| p.name == key) else {
            continue;
        };
        let value = match declared.param_type {
            ParameterType::Integer => raw.parse::<i32>().map(Value::from).map_err(|_| {
                GatewayError::InvalidValue {
                    key: key.clone(),
                    value: raw.clone(),
                    expected: ParameterType::Integer,
                }
            })?,
            ParameterType::Boolean => Value::Bool(raw.eq_ignore_ascii_case("true")),
            _ => Value::String(raw),
        };
        params.insert(key, value);
    }

    Ok(spec.validate(params)?)
}

fn string_param(params: &Params, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

fn int_param(params: &Params, key: &str) -> Option<i64> {
    params.get(key).and_then(Value::as_i64)
}

fn overflow_directory(endpoint_id: &str) -> String {
    let suffix: i32 = rand::thread_rng().gen();
    format!("overflow-{}-{}", endpoint_id, suffix)
}

fn text(status: StatusCode, message: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain")],
        format!("{}\n", message),
    )
        .into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        warn!(error = %self, "Gateway request rejected");
        text(StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward::effector::EffectorError;

    #[test]
    fn test_parse_full_attribute_set() {
        let gateway = parse_gateway(Some(
            "id=US&endpointId=US-1&host=localhost&port=44444\
             &diskStoreName=store&maximumQueueMemory=50&batchSize=10\
             &batchTimeInterval=250&alertThreshold=5\
             &batchConflation=TRUE&enablePersistence=yes",
        ))
        .unwrap();

        assert_eq!(gateway.id, "US");
        assert_eq!(gateway.endpoint_id, "US-1");
        assert_eq!(gateway.port, 44444);
        let attrs = &gateway.attributes;
        assert_eq!(attrs.disk_store_name.as_deref(), Some("store"));
        assert_eq!(attrs.maximum_queue_memory, Some(50));
        assert_eq!(attrs.batch_size, Some(10));
        assert_eq!(attrs.batch_time_interval, Some(250));
        assert_eq!(attrs.alert_threshold, Some(5));
        assert_eq!(attrs.batch_conflation, Some(true));
        assert_eq!(attrs.enable_persistence, Some(false));
        assert!(attrs.overflow_directory.starts_with("overflow-US-1-"));
    }

    #[test]
    fn test_unset_attributes_stay_unset() {
        let gateway = parse_gateway(Some("id=EU&endpointId=EU-1&host=h&port=1&extra=x")).unwrap();
        assert_eq!(gateway.attributes.batch_size, None);
        assert_eq!(gateway.attributes.disk_store_name, None);
    }

    #[test]
    fn test_missing_required_parameter() {
        let err = parse_gateway(Some("id=US&endpointId=US-1&host=localhost")).unwrap_err();
        assert_eq!(
            err,
            GatewayError::Parameters(EffectorError::MissingParameter {
                effector: "addGateway".to_string(),
                parameter: "port".to_string(),
            })
        );
    }

    #[test]
    fn test_non_numeric_and_out_of_range_values() {
        let err = parse_gateway(Some("id=US&endpointId=US-1&host=h&port=abc")).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidValue { ref key, .. } if key == "port"));

        let err = parse_gateway(Some("id=US&endpointId=US-1&host=h&port=70000")).unwrap_err();
        assert_eq!(err, GatewayError::PortOutOfRange(70000));

        let err = parse_gateway(Some("id=US&endpointId=US-1&host=h&port=1&batchSize=9999999999"))
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidValue { ref key, .. } if key == "batchSize"));
    }

    #[test]
    fn test_percent_decoding() {
        let gateway = parse_gateway(Some("id=New%20York&endpointId=NY-1&host=h&port=1")).unwrap();
        assert_eq!(gateway.id, "New York");
    }
}
