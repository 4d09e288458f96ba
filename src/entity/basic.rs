use crate::effector::{EffectorSpec, ParameterSpec, ParameterType, Params, TaskContext};
use crate::entity::{EntityBehavior, EntityContext};
use crate::lifecycle::ChildStateAggregator;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Entity with no process of its own.
///
/// On start it publishes the `sensors` object from its configuration as
/// attributes. The `setSensor` effector writes one attribute.
pub struct BasicEntity {
    type_name: String,
}

impl BasicEntity {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
        }
    }
}

#[async_trait]
impl EntityBehavior for BasicEntity {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn effectors(&self) -> Vec<EffectorSpec> {
        vec![EffectorSpec::new("setSensor", "Publish a value on one of this entity's sensors")
            .param(ParameterSpec::required("name", ParameterType::String))
            .param(ParameterSpec::required("value", ParameterType::Any))]
    }

    async fn start(&self, ctx: &EntityContext) -> anyhow::Result<()> {
        let sensors: Map<String, Value> = ctx.config("sensors").unwrap_or_default();
        if sensors.is_empty() {
            return Ok(());
        }
        debug!(entity_id = %ctx.entity_id(), count = sensors.len(), "Publishing configured sensors");
        ctx.store()
            .set_attributes(ctx.entity_id(), sensors.into_iter().collect())?;
        Ok(())
    }

    async fn invoke_effector(
        &self,
        ctx: &EntityContext,
        _task: &TaskContext,
        name: &str,
        mut params: Params,
    ) -> anyhow::Result<Value> {
        match name {
            "setSensor" => {
                let sensor = params
                    .remove("name")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .context("setSensor needs a sensor name")?;
                let value = params.remove("value").unwrap_or(Value::Null);
                ctx.store().set_attribute(ctx.entity_id(), &sensor, value)?;
                Ok(Value::Null)
            }
            other => anyhow::bail!("{} has no effector '{}'", self.type_name, other),
        }
    }
}

/// Group whose members are its children; its state follows theirs.
pub struct BasicGroup {
    type_name: String,
}

impl BasicGroup {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
        }
    }
}

#[async_trait]
impl EntityBehavior for BasicGroup {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn init(&self, ctx: &EntityContext) -> anyhow::Result<()> {
        ctx.add_policy(Arc::new(ChildStateAggregator::new()))?;
        Ok(())
    }
}
