// Subscription registry and sensor event delivery

pub mod manager;
pub mod protocol;

pub use manager::{Callback, SubscriptionRegistry};
pub use protocol::{EntitySelector, SensorFilter, SubscriptionHandle};

#[cfg(test)]
mod tests;
