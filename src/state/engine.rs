use crate::state::entity::{Entity, EntityId, SensorEvent};
use crate::state::sensor::{Sensor, GROUP_MEMBERS};
use crate::subscription::SubscriptionRegistry;
use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Entity store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity '{0}' not found")]
    NotFound(EntityId),

    #[error("entity '{0}' already exists")]
    AlreadyExists(EntityId),

    #[error("parent entity '{0}' not found")]
    ParentNotFound(EntityId),

    #[error("value for sensor '{sensor}' is not serializable: {source}")]
    Serialization {
        sensor: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Parameters for creating an entity
#[derive(Clone, Debug, Default)]
pub struct NewEntity {
    /// Explicit id; a UUIDv7 is generated when `None`
    pub id: Option<EntityId>,
    pub parent: Option<EntityId>,
    pub entity_type: String,
    pub name: String,
    pub config: BTreeMap<String, Value>,
}

/// In-memory entity tree and attribute store.
///
/// Each entity's record lives in one DashMap slot, so the slot's write guard is the
/// per-entity writer lock: attribute writes on one entity are serialized, writes and
/// reads on other entities proceed independently. Events are handed to the
/// subscription registry while the guard is held.
pub struct EntityStore {
    entities: DashMap<EntityId, Entity>,
    bus: Arc<SubscriptionRegistry>,
}

impl EntityStore {
    pub fn new(bus: Arc<SubscriptionRegistry>) -> Self {
        Self {
            entities: DashMap::new(),
            bus,
        }
    }

    /// Subscription registry events are published to
    pub fn bus(&self) -> &Arc<SubscriptionRegistry> {
        &self.bus
    }

    /// Create an entity and append it to its parent's children.
    pub fn create_entity(&self, spec: NewEntity) -> Result<EntityId, StoreError> {
        let id = spec
            .id
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

        if let Some(ref parent) = spec.parent {
            if !self.entities.contains_key(parent) {
                return Err(StoreError::ParentNotFound(parent.clone()));
            }
        }

        let now = Utc::now();
        match self.entities.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::AlreadyExists(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Entity {
                    id: id.clone(),
                    entity_type: spec.entity_type.clone(),
                    name: spec.name.clone(),
                    parent: spec.parent.clone(),
                    children: Vec::new(),
                    config: spec.config,
                    attributes: BTreeMap::new(),
                    sequence: 0,
                    created_at: now,
                    last_updated: now,
                });
            }
        }

        if let Some(parent) = spec.parent {
            let child = id.clone();
            self.commit(&parent, move |entity| {
                if !entity.children.contains(&child) {
                    entity.children.push(child);
                }
                vec![(GROUP_MEMBERS.name().to_string(), members_value(entity))]
            })?;
        }

        info!(
            entity_id = %id,
            entity_type = %spec.entity_type,
            name = %spec.name,
            "Entity created"
        );

        Ok(id)
    }

    /// Remove an entity and, children first, its whole subtree.
    ///
    /// Returns the removed ids in removal order. Subscriptions owned by removed entities
    /// are dropped.
    pub fn remove_entity(&self, id: &str) -> Result<Vec<EntityId>, StoreError> {
        let children = self.children(id)?;
        let mut removed = Vec::new();
        for child in children {
            // A concurrent removal of the same child is not an error here
            match self.remove_entity(&child) {
                Ok(ids) => removed.extend(ids),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let (_, entity) = self
            .entities
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.bus.unsubscribe_all(id);

        if let Some(parent) = entity.parent {
            let child = id.to_string();
            let result = self.commit(&parent, move |p| {
                p.children.retain(|c| *c != child);
                vec![(GROUP_MEMBERS.name().to_string(), members_value(p))]
            });
            // Parent may be mid-removal itself
            if let Err(e) = result {
                debug!(entity_id = %id, error = %e, "Parent gone while removing child");
            }
        }

        info!(entity_id = %id, "Entity removed");
        removed.push(id.to_string());
        Ok(removed)
    }

    /// Get a snapshot of an entity
    pub fn get_entity(&self, id: &str) -> Option<Entity> {
        self.entities.get(id).map(|e| e.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Snapshot of all entities
    pub fn get_all_entities(&self) -> Vec<Entity> {
        self.entities.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn children(&self, id: &str) -> Result<Vec<EntityId>, StoreError> {
        self.entities
            .get(id)
            .map(|e| e.children.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// The entity followed by its ancestors, nearest first.
    pub fn lineage(&self, id: &str) -> Result<Vec<EntityId>, StoreError> {
        let mut lineage = vec![id.to_string()];
        let mut parent = self
            .entities
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .parent
            .clone();

        while let Some(p) = parent {
            parent = self.entities.get(&p).and_then(|e| e.parent.clone());
            lineage.push(p);
        }

        Ok(lineage)
    }

    /// Write one attribute. Returns the published event, or `None` if the value was unchanged.
    pub fn set_attribute(
        &self,
        id: &str,
        sensor: &str,
        value: Value,
    ) -> Result<Option<SensorEvent>, StoreError> {
        let mut events = self.set_attributes(id, vec![(sensor.to_string(), value)])?;
        Ok(events.pop())
    }

    /// Write several attributes atomically with respect to readers of this entity.
    ///
    /// One event is published per sensor whose value actually changed, in argument order.
    pub fn set_attributes(
        &self,
        id: &str,
        writes: Vec<(String, Value)>,
    ) -> Result<Vec<SensorEvent>, StoreError> {
        self.commit(id, move |_| writes)
    }

    /// Read-modify-write under the entity's write guard.
    ///
    /// `compute` sees the current record and returns the attribute writes to commit. It must
    /// not call back into the store.
    pub fn update<F>(&self, id: &str, compute: F) -> Result<Vec<SensorEvent>, StoreError>
    where
        F: FnOnce(&Entity) -> Vec<(String, Value)>,
    {
        self.commit(id, move |entity| compute(entity))
    }

    /// Typed write
    pub fn set<T: Serialize>(
        &self,
        id: &str,
        sensor: &Sensor<T>,
        value: &T,
    ) -> Result<Option<SensorEvent>, StoreError> {
        let value = to_value(sensor.name(), value)?;
        self.set_attribute(id, sensor.name(), value)
    }

    /// Last committed value, or `None`
    pub fn get_attribute(&self, id: &str, sensor: &str) -> Option<Value> {
        self.entities
            .get(id)
            .and_then(|e| e.attributes.get(sensor).cloned())
    }

    /// Last committed value together with the entity's write sequence at read time
    pub fn get_attribute_versioned(&self, id: &str, sensor: &str) -> Option<(Option<Value>, u64)> {
        self.entities
            .get(id)
            .map(|e| (e.attributes.get(sensor).cloned(), e.sequence))
    }

    /// Typed read; `None` when absent or not decodable as `T`
    pub fn get<T: DeserializeOwned>(&self, id: &str, sensor: &Sensor<T>) -> Option<T> {
        self.get_attribute(id, sensor.name())
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Consistent snapshot of all attributes of one entity
    pub fn attributes(&self, id: &str) -> Option<BTreeMap<String, Value>> {
        self.entities.get(id).map(|e| e.attributes.clone())
    }

    /// Current children as a set, the shape published on `group.members`
    pub fn members(&self, id: &str) -> Option<BTreeSet<EntityId>> {
        self.entities
            .get(id)
            .map(|e| e.children.iter().cloned().collect())
    }

    /// Apply a mutation under the entity's write guard and publish resulting events.
    fn commit<F>(&self, id: &str, mutate: F) -> Result<Vec<SensorEvent>, StoreError>
    where
        F: FnOnce(&mut Entity) -> Vec<(String, Value)>,
    {
        // Parents never change after creation, so the lineage can be read before locking;
        // holding this entity's guard while reading others could deadlock on a shared shard.
        let lineage = self.lineage(id)?;

        let mut entity = self
            .entities
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let writes = mutate(&mut entity);
        let now = Utc::now();
        let mut events = Vec::new();

        for (sensor, value) in writes {
            let old_value = entity.attributes.get(&sensor).cloned();
            if old_value.as_ref() == Some(&value) {
                continue;
            }

            entity.attributes.insert(sensor.clone(), value.clone());
            entity.sequence += 1;
            entity.last_updated = now;

            let event = SensorEvent {
                source: id.to_string(),
                sensor,
                old_value,
                new_value: value,
                sequence: entity.sequence,
                timestamp: now,
            };
            self.bus.publish(&event, &lineage);
            events.push(event);
        }

        Ok(events)
    }
}

fn members_value(entity: &Entity) -> Value {
    let members: BTreeSet<&EntityId> = entity.children.iter().collect();
    serde_json::to_value(members).unwrap_or(Value::Array(Vec::new()))
}

/// Serialize a typed sensor value
pub(crate) fn to_value<T: Serialize>(sensor: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|source| StoreError::Serialization {
        sensor: sensor.to_string(),
        source,
    })
}
