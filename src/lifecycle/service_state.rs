use crate::lifecycle::Lifecycle;
use crate::state::to_value;
use crate::state::sensor::{
    Sensor, SERVICE_NOT_UP_INDICATORS, SERVICE_STATE, SERVICE_STATE_EXPECTED, SERVICE_UP,
};
use crate::state::{Entity, EntityStore, SensorEvent, StoreError};
use crate::subscription::{EntitySelector, SensorFilter, SubscriptionHandle};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Key prefix used by [`ChildStateAggregator`](super::ChildStateAggregator) indicators
pub const NOT_UP_INDICATOR_PREFIX_CHILD: &str = "child:";

/// Maintains `service.notUp.indicators`, `service.isUp` and `service.state` together.
///
/// Every mutation goes through one store update so a reader never sees an indicator map
/// that disagrees with the published up flag or lifecycle state.
pub struct ServiceStateLogic;

impl ServiceStateLogic {
    /// Add (`Some(reason)`) or clear (`None`) one not-up indicator, then re-derive state.
    pub fn update_not_up_indicator(
        store: &EntityStore,
        entity_id: &str,
        key: &str,
        reason: Option<&str>,
    ) -> Result<Vec<SensorEvent>, StoreError> {
        let key = key.to_string();
        let reason = reason.map(|r| r.to_string());
        store.update(entity_id, move |entity| {
            let mut indicators = indicators_of(entity);
            match reason {
                Some(r) => {
                    indicators.insert(key, r);
                }
                None => {
                    indicators.remove(&key);
                }
            }
            derived_writes(entity, indicators, None)
        })
    }

    /// Replace every indicator whose key starts with `prefix` by `replacement`.
    pub fn replace_indicators(
        store: &EntityStore,
        entity_id: &str,
        prefix: &str,
        replacement: BTreeMap<String, String>,
    ) -> Result<Vec<SensorEvent>, StoreError> {
        let prefix = prefix.to_string();
        store.update(entity_id, move |entity| {
            let mut indicators = indicators_of(entity);
            indicators.retain(|k, _| !k.starts_with(&prefix));
            indicators.extend(replacement);
            derived_writes(entity, indicators, None)
        })
    }

    /// Record the state the entity is being driven towards and re-derive the actual state.
    pub fn set_expected(
        store: &EntityStore,
        entity_id: &str,
        expected: Lifecycle,
    ) -> Result<Vec<SensorEvent>, StoreError> {
        store.update(entity_id, move |entity| {
            let previous: Option<Lifecycle> = typed(entity, &SERVICE_STATE_EXPECTED);
            if let Some(previous) = previous {
                if !previous.can_transition_to(expected) {
                    warn!(
                        entity_id = %entity.id,
                        from = %previous,
                        to = %expected,
                        "Unusual lifecycle transition"
                    );
                }
            }
            let indicators = indicators_of(entity);
            derived_writes(entity, indicators, Some(expected))
        })
    }

    /// Current lifecycle state, `None` if never set
    pub fn state(store: &EntityStore, entity_id: &str) -> Option<Lifecycle> {
        store.get(entity_id, &SERVICE_STATE)
    }

    /// Map a boolean health sensor onto a not-up indicator.
    ///
    /// While `source` is anything but `true` the indicator `source`-name holds `reason`.
    /// Unless the entity is already RUNNING, the indicator is seeded with `initial_reason`
    /// so the entity does not look healthy before the first reading arrives.
    pub fn connect_indicator(
        store: &Arc<EntityStore>,
        subscriber: &str,
        entity_id: &str,
        source: Sensor<bool>,
        initial_reason: &str,
        reason: &str,
    ) -> Result<SubscriptionHandle, StoreError> {
        if Self::state(store, entity_id) != Some(Lifecycle::Running) {
            Self::update_not_up_indicator(store, entity_id, source.name(), Some(initial_reason))?;
        }

        let writer = Arc::clone(store);
        let reason = reason.to_string();
        let handle = store.bus().subscribe(
            subscriber,
            EntitySelector::Entity(entity_id.to_string()),
            SensorFilter::sensor(source.name()),
            move |event| {
                let answering = event.value::<bool>() == Some(true);
                debug!(
                    entity_id = %event.source,
                    sensor = %event.sensor,
                    answering,
                    "Health reading"
                );
                let reason = if answering { None } else { Some(reason.as_str()) };
                Self::update_not_up_indicator(&writer, &event.source, source.name(), reason)?;
                Ok(())
            },
        );

        Ok(handle)
    }
}

fn typed<T: serde::de::DeserializeOwned>(entity: &Entity, sensor: &Sensor<T>) -> Option<T> {
    entity
        .attributes
        .get(sensor.name())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn indicators_of(entity: &Entity) -> BTreeMap<String, String> {
    typed(entity, &SERVICE_NOT_UP_INDICATORS).unwrap_or_default()
}

fn derived_writes(
    entity: &Entity,
    indicators: BTreeMap<String, String>,
    expected: Option<Lifecycle>,
) -> Vec<(String, Value)> {
    let current: Option<Lifecycle> = typed(entity, &SERVICE_STATE);
    let expected_now = expected
        .or_else(|| typed(entity, &SERVICE_STATE_EXPECTED))
        .unwrap_or(Lifecycle::Created);
    let healthy = indicators.is_empty();
    let state = Lifecycle::derive(expected_now, current, healthy);
    // A stopped or never-started entity is not up, whatever its indicators say
    let up = healthy && matches!(expected_now, Lifecycle::Starting | Lifecycle::Running);

    let mut writes = Vec::with_capacity(4);
    if let Some(expected) = expected {
        push(&mut writes, &SERVICE_STATE_EXPECTED, &expected);
    }
    push(&mut writes, &SERVICE_NOT_UP_INDICATORS, &indicators);
    push(&mut writes, &SERVICE_UP, &up);
    push(&mut writes, &SERVICE_STATE, &state);
    writes
}

fn push<T: serde::Serialize>(writes: &mut Vec<(String, Value)>, sensor: &Sensor<T>, value: &T) {
    match to_value(sensor.name(), value) {
        Ok(v) => writes.push((sensor.name().to_string(), v)),
        Err(e) => warn!(error = %e, "Dropping unserializable lifecycle write"),
    }
}
