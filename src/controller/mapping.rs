use crate::controller::ssl::ProxySslConfig;
use crate::controller::template::MappingView;
use crate::effector::{EffectorSpec, ParameterSpec, ParameterType, Params, TaskContext};
use crate::entity::{EntityBehavior, EntityContext};
use crate::state::{EntityStore, Sensor};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;

pub const TARGET_ADDRESSES: Sensor<BTreeSet<String>> = Sensor::new(
    "urlmapping.targetAddresses",
    "host:port addresses requests for this mapping are sent to",
);

/// Routes one domain (and optionally a path prefix) to a set of targets.
///
/// Config: `domain` (required), `path`, `ssl`, and `targets` published at start.
pub struct UrlMapping;

#[async_trait]
impl EntityBehavior for UrlMapping {
    fn type_name(&self) -> &str {
        "url-mapping"
    }

    fn effectors(&self) -> Vec<EffectorSpec> {
        vec![EffectorSpec::new("setTargets", "Replace the mapping's target addresses")
            .param(ParameterSpec::required("addresses", ParameterType::List))]
    }

    fn init(&self, ctx: &EntityContext) -> anyhow::Result<()> {
        let domain: Option<String> = ctx.config("domain");
        if domain.filter(|d| !d.is_empty()).is_none() {
            anyhow::bail!("url-mapping needs a 'domain'");
        }
        Ok(())
    }

    async fn start(&self, ctx: &EntityContext) -> anyhow::Result<()> {
        if let Some(targets) = ctx.config::<BTreeSet<String>>("targets") {
            ctx.set(&TARGET_ADDRESSES, &targets)?;
        }
        Ok(())
    }

    async fn invoke_effector(
        &self,
        ctx: &EntityContext,
        _task: &TaskContext,
        name: &str,
        params: Params,
    ) -> anyhow::Result<Value> {
        match name {
            "setTargets" => {
                let addresses: BTreeSet<String> = params
                    .get("addresses")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .context("addresses must be a list of host:port strings")?
                    .unwrap_or_default();
                ctx.set(&TARGET_ADDRESSES, &addresses)?;
                Ok(Value::from(addresses.len()))
            }
            other => anyhow::bail!("url-mapping has no effector '{}'", other),
        }
    }
}

/// Read a url-mapping entity as the renderer sees it
pub fn mapping_view(store: &EntityStore, id: &str) -> Option<MappingView> {
    let entity = store.get_entity(id)?;
    let domain: String = entity.config_value("domain")?;
    Some(MappingView {
        id: entity.id.clone(),
        domain,
        path: entity
            .config_value::<String>("path")
            .filter(|p| !p.is_empty()),
        ssl: entity.config_value::<ProxySslConfig>("ssl"),
        addresses: store.get(id, &TARGET_ADDRESSES).unwrap_or_default(),
    })
}
