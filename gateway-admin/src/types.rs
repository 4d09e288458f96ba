use serde::Serialize;
use steward::effector::{EffectorError, ParameterType};
use thiserror::Error;

/// Queue tuning for a gateway's outbound event queue.
///
/// Every field is optional; unset fields keep the remote side's defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayQueueAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_store_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_queue_memory: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_time_interval: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_threshold: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_conflation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_persistence: Option<bool>,
    /// Always assigned on add: `overflow-<endpointId>-<random>`
    pub overflow_directory: String,
}

/// A named remote endpoint events are forwarded to
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    pub id: String,
    pub endpoint_id: String,
    pub host: String,
    pub port: u16,
    pub attributes: GatewayQueueAttributes,
}

/// Admin request errors; every variant answers 500 with its message
#[derive(Debug, Error, PartialEq)]
pub enum GatewayError {
    #[error("malformed query string: {0}")]
    MalformedQuery(String),

    #[error("parameter '{key}' must be {expected}, got '{value}'")]
    InvalidValue {
        key: String,
        value: String,
        expected: ParameterType,
    },

    #[error("port {0} is out of range")]
    PortOutOfRange(i64),

    #[error(transparent)]
    Parameters(#[from] EffectorError),
}
