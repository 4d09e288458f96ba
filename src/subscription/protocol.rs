use crate::state::{EntityId, SensorEvent};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a registered subscription; returned by `subscribe`, consumed by `unsubscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub(crate) u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Which entities a subscription listens to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntitySelector {
    /// Events published by exactly this entity
    Entity(EntityId),
    /// Events published by this entity or any entity below it in the tree
    Descendants(EntityId),
}

impl EntitySelector {
    /// `lineage` is the source entity followed by its ancestors, nearest first.
    pub fn matches(&self, lineage: &[EntityId]) -> bool {
        match self {
            EntitySelector::Entity(id) => lineage.first() == Some(id),
            EntitySelector::Descendants(root) => lineage.iter().any(|id| id == root),
        }
    }
}

/// Which sensors a subscription listens to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SensorFilter {
    Sensor(String),
    Any,
}

impl SensorFilter {
    pub fn sensor(name: impl Into<String>) -> Self {
        SensorFilter::Sensor(name.into())
    }

    pub fn matches(&self, event: &SensorEvent) -> bool {
        match self {
            SensorFilter::Sensor(name) => *name == event.sensor,
            SensorFilter::Any => true,
        }
    }
}
