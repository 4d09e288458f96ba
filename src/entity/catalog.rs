use crate::entity::{BasicEntity, BasicGroup, EntityBehavior};
use dashmap::DashMap;
use std::sync::Arc;

pub type BehaviorFactory = Arc<dyn Fn() -> Arc<dyn EntityBehavior> + Send + Sync>;

/// Type name to behavior factory.
///
/// Unknown types are not an error: they get a [`BasicEntity`] carrying the
/// requested type tag.
pub struct EntityCatalog {
    factories: DashMap<String, BehaviorFactory>,
}

impl EntityCatalog {
    /// Catalog with `basic`, `group` and `application` registered
    pub fn new() -> Self {
        let catalog = Self {
            factories: DashMap::new(),
        };
        catalog.register("basic", || Arc::new(BasicEntity::new("basic")));
        catalog.register("group", || Arc::new(BasicGroup::new("group")));
        catalog.register("application", || Arc::new(BasicGroup::new("application")));
        catalog
    }

    /// Register or replace the factory for `type_name`
    pub fn register<F>(&self, type_name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn EntityBehavior> + Send + Sync + 'static,
    {
        self.factories
            .insert(type_name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn create(&self, type_name: &str) -> Arc<dyn EntityBehavior> {
        // Clone the factory out so it never runs under the map's guard
        let factory = self.factories.get(type_name).map(|f| Arc::clone(f.value()));
        match factory {
            Some(factory) => factory(),
            None => Arc::new(BasicEntity::new(type_name)),
        }
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|f| f.key().clone()).collect();
        types.sort();
        types
    }
}

impl Default for EntityCatalog {
    fn default() -> Self {
        Self::new()
    }
}
