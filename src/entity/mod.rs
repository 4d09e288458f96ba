//! Entity types: the behavior trait, its context, and the type catalog.

mod basic;
mod catalog;

pub use basic::{BasicEntity, BasicGroup};
pub use catalog::{BehaviorFactory, EntityCatalog};

use crate::controller::ReconcileOutcome;
use crate::effector::{EffectorSpec, Params, TaskContext};
use crate::management::ManagementContext;
use crate::policy::{Policy, PolicyError};
use crate::state::{Entity, EntityId, EntityStore, Sensor, SensorEvent, StoreError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Behavior of one entity type.
///
/// `start`, `stop` and `restart` are built in for every entity and drive the
/// lifecycle; a type only supplies what happens in between. Type-specific
/// effectors are declared by [`effectors`](Self::effectors) and executed by
/// [`invoke_effector`](Self::invoke_effector) after their parameters have
/// been validated against the declared schema.
#[async_trait]
pub trait EntityBehavior: Send + Sync {
    fn type_name(&self) -> &str;

    fn effectors(&self) -> Vec<EffectorSpec> {
        Vec::new()
    }

    /// Called once, right after the entity is created
    fn init(&self, _ctx: &EntityContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self, _ctx: &EntityContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &EntityContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn invoke_effector(
        &self,
        _ctx: &EntityContext,
        _task: &TaskContext,
        name: &str,
        _params: Params,
    ) -> anyhow::Result<Value> {
        anyhow::bail!("{} has no effector '{}'", self.type_name(), name)
    }

    /// Entities that converge generated configuration expose it here
    fn reconcilable(&self) -> Option<&dyn Reconcilable> {
        None
    }
}

/// Capability of entities that reconcile derived configuration
#[async_trait]
pub trait Reconcilable: Send + Sync {
    /// Ask for a reconciliation run without waiting for it
    fn request_reconcile(&self);

    /// Run one reconciliation now and report what happened
    async fn reconcile(&self) -> ReconcileOutcome;
}

/// Handed to behavior hooks; scoped to one entity
#[derive(Clone)]
pub struct EntityContext {
    entity_id: EntityId,
    mgmt: Arc<ManagementContext>,
}

impl EntityContext {
    pub(crate) fn new(entity_id: &str, mgmt: Arc<ManagementContext>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            mgmt,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn mgmt(&self) -> &Arc<ManagementContext> {
        &self.mgmt
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        self.mgmt.store()
    }

    pub fn entity(&self) -> Option<Entity> {
        self.store().get_entity(&self.entity_id)
    }

    /// Typed configuration value
    pub fn config<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.entity().and_then(|e| e.config_value(key))
    }

    pub fn get<T: DeserializeOwned>(&self, sensor: &Sensor<T>) -> Option<T> {
        self.store().get(&self.entity_id, sensor)
    }

    pub fn set<T: Serialize>(
        &self,
        sensor: &Sensor<T>,
        value: &T,
    ) -> Result<Option<SensorEvent>, StoreError> {
        self.store().set(&self.entity_id, sensor, value)
    }

    pub fn add_policy(&self, policy: Arc<dyn Policy>) -> Result<String, PolicyError> {
        self.mgmt.policies().add_policy(&self.entity_id, policy)
    }
}

#[cfg(test)]
mod tests;
