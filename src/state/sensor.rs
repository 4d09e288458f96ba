//! Typed sensor names and the well-known sensors shared across entity types.

use crate::lifecycle::Lifecycle;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;

/// A named, typed slot in an entity's attribute map.
///
/// Values are stored as JSON; the type parameter only drives (de)serialization
/// at the typed accessors of [`EntityStore`](crate::state::EntityStore).
pub struct Sensor<T> {
    name: &'static str,
    description: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> Sensor<T> {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn description(&self) -> &'static str {
        self.description
    }
}

impl<T> Clone for Sensor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Sensor<T> {}

impl<T> fmt::Debug for Sensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sensor").field(&self.name).finish()
    }
}

/// Child ids of a group; republished on every add/remove.
pub const GROUP_MEMBERS: Sensor<BTreeSet<String>> =
    Sensor::new("group.members", "Ids of the entity's current children");

pub const SERVICE_UP: Sensor<bool> =
    Sensor::new("service.isUp", "Whether the service is up and answering");

pub const SERVICE_STATE: Sensor<Lifecycle> =
    Sensor::new("service.state", "Actual lifecycle state of the entity");

pub const SERVICE_STATE_EXPECTED: Sensor<Lifecycle> =
    Sensor::new("service.state.expected", "Lifecycle state the entity is being driven towards");

pub const SERVICE_NOT_UP_INDICATORS: Sensor<BTreeMap<String, String>> = Sensor::new(
    "service.notUp.indicators",
    "Reasons the service is not up; empty when healthy",
);

pub const MAIN_URI: Sensor<String> = Sensor::new("main.uri", "Primary externally reachable URI");

/// `host:port` a member serves on; read by controllers balancing over a server pool
pub const HOST_ENDPOINT: Sensor<String> =
    Sensor::new("host.endpoint", "host:port the entity serves traffic on");
