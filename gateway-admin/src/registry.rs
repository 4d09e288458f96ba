//! Gateway registry - receives add/remove notifications from the admin endpoint.

use crate::types::Gateway;
use dashmap::DashMap;
use tracing::info;

/// Receiver of gateway changes.
///
/// The admin endpoint only parses and validates; whatever implements this
/// decides what adding or removing a gateway means.
pub trait GatewayChangeListener: Send + Sync {
    fn gateway_added(&self, gateway: Gateway);

    /// Returns false when no gateway with `id` existed
    fn gateway_removed(&self, id: &str) -> bool;
}

/// In-memory gateway table keyed by gateway id. Adding an existing id replaces it.
#[derive(Default)]
pub struct GatewayRegistry {
    gateways: DashMap<String, Gateway>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Gateway> {
        self.gateways.get(id).map(|g| g.clone())
    }

    /// All gateways, sorted by id
    pub fn list(&self) -> Vec<Gateway> {
        let mut gateways: Vec<Gateway> = self.gateways.iter().map(|g| g.clone()).collect();
        gateways.sort_by(|a, b| a.id.cmp(&b.id));
        gateways
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}

impl GatewayChangeListener for GatewayRegistry {
    fn gateway_added(&self, gateway: Gateway) {
        info!(
            gateway_id = %gateway.id,
            endpoint_id = %gateway.endpoint_id,
            host = %gateway.host,
            port = gateway.port,
            overflow = %gateway.attributes.overflow_directory,
            "Gateway added"
        );
        self.gateways.insert(gateway.id.clone(), gateway);
    }

    fn gateway_removed(&self, id: &str) -> bool {
        let removed = self.gateways.remove(id).is_some();
        info!(gateway_id = %id, removed, "Gateway removal requested");
        removed
    }
}
