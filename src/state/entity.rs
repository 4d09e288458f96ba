use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type EntityId = String;

/// A managed component node: identity, immutable configuration, mutable sensors
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier (UUIDv7 unless supplied by the caller)
    pub id: EntityId,

    /// Type tag, e.g. "proxy-controller" or a catalog type name
    #[serde(rename = "type")]
    pub entity_type: String,

    /// Human-facing name, unique among siblings
    pub name: String,

    /// Parent entity (not owned)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityId>,

    /// Owned children, in creation order
    pub children: Vec<EntityId>,

    /// Configuration fixed at creation
    pub config: BTreeMap<String, Value>,

    /// Current sensor values
    pub attributes: BTreeMap<String, Value>,

    /// Number of committed attribute writes
    pub sequence: u64,

    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Entity {
    /// Read a typed configuration value; `None` if absent or of the wrong shape.
    pub fn config_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Immutable record of one committed attribute change
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SensorEvent {
    pub source: EntityId,
    pub sensor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    pub new_value: Value,
    /// Source entity's write sequence after this change
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl SensorEvent {
    /// Decode the new value as `T`
    pub fn value<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.new_value.clone()).ok()
    }
}
