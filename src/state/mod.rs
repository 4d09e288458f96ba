// Entity tree, attribute store and sensor events

mod engine;
mod entity;
pub mod sensor;

pub use engine::{EntityStore, NewEntity, StoreError};
pub(crate) use engine::to_value;
pub use entity::{Entity, EntityId, SensorEvent};
pub use sensor::Sensor;
