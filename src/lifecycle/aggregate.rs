use crate::lifecycle::service_state::{ServiceStateLogic, NOT_UP_INDICATOR_PREFIX_CHILD};
use crate::lifecycle::Lifecycle;
use crate::policy::{Policy, PolicyContext};
use crate::state::sensor::{GROUP_MEMBERS, SERVICE_STATE};
use crate::state::EntityStore;
use crate::subscription::{EntitySelector, SensorFilter};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Keeps one not-up indicator on its entity per child that is not RUNNING.
///
/// Recomputed whenever a child's `service.state` or the child set changes.
#[derive(Default)]
pub struct ChildStateAggregator {
    recompute: Mutex<()>,
}

impl ChildStateAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn refresh(&self, store: &EntityStore, parent: &str) -> anyhow::Result<()> {
        let _serial = self.recompute.lock().unwrap_or_else(|e| e.into_inner());

        let mut indicators = BTreeMap::new();
        for child in store.children(parent)? {
            let state: Option<Lifecycle> = store.get(&child, &SERVICE_STATE);
            if state == Some(Lifecycle::Running) {
                continue;
            }
            let name = store
                .get_entity(&child)
                .map(|e| if e.name.is_empty() { child.clone() } else { e.name })
                .unwrap_or_else(|| child.clone());
            let reason = match state {
                Some(state) => format!("{} is {}", name, state),
                None => format!("{} has not started", name),
            };
            indicators.insert(format!("{}{}", NOT_UP_INDICATOR_PREFIX_CHILD, child), reason);
        }

        debug!(entity_id = %parent, unhealthy_children = indicators.len(), "Child states aggregated");
        ServiceStateLogic::replace_indicators(store, parent, NOT_UP_INDICATOR_PREFIX_CHILD, indicators)?;
        Ok(())
    }
}

impl Policy for ChildStateAggregator {
    fn name(&self) -> &str {
        "child-state-aggregator"
    }

    fn attach(self: Arc<Self>, ctx: &PolicyContext) -> anyhow::Result<()> {
        let parent = ctx.entity_id().to_string();

        let (aggregator, store, owner) = (Arc::clone(&self), Arc::clone(ctx.store()), parent.clone());
        ctx.subscribe(
            EntitySelector::Descendants(parent.clone()),
            SensorFilter::sensor(SERVICE_STATE.name()),
            move |event| {
                // Only direct children count; the parent's own state is derived from this
                let is_child = store
                    .get_entity(&event.source)
                    .and_then(|e| e.parent)
                    .as_deref()
                    == Some(owner.as_str());
                if !is_child {
                    return Ok(());
                }
                aggregator.refresh(&store, &owner)
            },
        );

        let (aggregator, store, owner) = (Arc::clone(&self), Arc::clone(ctx.store()), parent.clone());
        ctx.subscribe(
            EntitySelector::Entity(parent.clone()),
            SensorFilter::sensor(GROUP_MEMBERS.name()),
            move |_| aggregator.refresh(&store, &owner),
        );

        self.refresh(ctx.store(), &parent)
    }
}
