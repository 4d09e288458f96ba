//! The management context: one explicitly owned registry for everything that
//! manages entities. Components reach each other through it instead of
//! through process-wide globals.

use crate::config::StewardConfig;
use crate::controller::{self, ReconcileOutcome};
use crate::effector::{EffectorError, EffectorSpec, Params, TaskExecutor, TaskHandle};
use crate::entity::{EntityBehavior, EntityCatalog, EntityContext};
use crate::feed::FeedRunner;
use crate::lifecycle::{Lifecycle, ServiceStateLogic};
use crate::policy::{HttpNotifierPolicy, Policy, PolicyError, PolicyHost};
use crate::state::{EntityId, EntityStore, NewEntity, StoreError};
use crate::subscription::SubscriptionRegistry;
use anyhow::Context;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ManagementError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("entity '{entity}' failed to initialise: {source:#}")]
    Init {
        entity: EntityId,
        #[source]
        source: anyhow::Error,
    },
}

/// Effectors every entity has
const BUILTIN_EFFECTORS: [(&str, &str); 3] = [
    ("start", "Start the entity and its children"),
    ("stop", "Stop the entity and its children"),
    ("restart", "Stop, then start the entity"),
];

pub struct ManagementContext {
    config: StewardConfig,
    store: Arc<EntityStore>,
    feeds: FeedRunner,
    policies: PolicyHost,
    tasks: TaskExecutor,
    catalog: EntityCatalog,
    behaviors: DashMap<EntityId, Arc<dyn EntityBehavior>>,
    me: Weak<ManagementContext>,
}

impl ManagementContext {
    /// Build a context with the default entity catalog and the proxy types.
    pub fn new(config: StewardConfig) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<ManagementContext>| {
            let store = Arc::new(EntityStore::new(Arc::new(SubscriptionRegistry::new())));
            let catalog = EntityCatalog::new();
            controller::register_types(&catalog, &config.proxy);

            Self {
                feeds: FeedRunner::new(
                    Arc::clone(&store),
                    Duration::from_millis(config.feeds.poll_timeout_ms),
                ),
                policies: PolicyHost::new(Arc::clone(&store), me.clone()),
                tasks: TaskExecutor::new(config.tasks.max_concurrent)
                    .retain_finished(config.tasks.retain_finished),
                catalog,
                behaviors: DashMap::new(),
                store,
                config,
                me: me.clone(),
            }
        })
    }

    pub fn config(&self) -> &StewardConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn feeds(&self) -> &FeedRunner {
        &self.feeds
    }

    pub fn policies(&self) -> &PolicyHost {
        &self.policies
    }

    pub fn tasks(&self) -> &TaskExecutor {
        &self.tasks
    }

    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }

    pub fn behavior(&self, entity_id: &str) -> Option<Arc<dyn EntityBehavior>> {
        self.behaviors.get(entity_id).map(|b| Arc::clone(b.value()))
    }

    /// Create an entity whose behavior comes from the catalog
    pub fn create_entity(&self, spec: NewEntity) -> Result<EntityId, ManagementError> {
        let behavior = self.catalog.create(&spec.entity_type);
        self.add_entity_with_behavior(spec, behavior)
    }

    /// Create an entity with an explicit behavior.
    ///
    /// The entity starts CREATED. If the behavior's `init` fails the entity is
    /// destroyed again.
    pub fn add_entity_with_behavior(
        &self,
        mut spec: NewEntity,
        behavior: Arc<dyn EntityBehavior>,
    ) -> Result<EntityId, ManagementError> {
        if spec.entity_type.is_empty() {
            spec.entity_type = behavior.type_name().to_string();
        }
        let id = self.store.create_entity(spec)?;
        self.behaviors.insert(id.clone(), Arc::clone(&behavior));
        ServiceStateLogic::set_expected(&self.store, &id, Lifecycle::Created)?;

        if let Some(url) = &self.config.notifier.webhook_url {
            self.policies
                .add_policy(&id, Arc::new(HttpNotifierPolicy::new(url.clone())))?;
        }

        let init = self.context(&id).and_then(|ctx| behavior.init(&ctx));
        if let Err(source) = init {
            warn!(entity_id = %id, error = %source, "Entity init failed");
            let _ = self.destroy(&id);
            return Err(ManagementError::Init { entity: id, source });
        }

        Ok(id)
    }

    pub fn add_policy(
        &self,
        entity_id: &str,
        policy: Arc<dyn Policy>,
    ) -> Result<String, PolicyError> {
        self.policies.add_policy(entity_id, policy)
    }

    /// Built-in plus type-specific effectors of an entity
    pub fn effectors(&self, entity_id: &str) -> Result<Vec<EffectorSpec>, EffectorError> {
        if !self.store.contains(entity_id) {
            return Err(EffectorError::EntityNotFound(entity_id.to_string()));
        }
        let mut specs: Vec<EffectorSpec> = BUILTIN_EFFECTORS
            .iter()
            .map(|(name, description)| EffectorSpec::new(name, description))
            .collect();
        if let Some(behavior) = self.behavior(entity_id) {
            specs.extend(
                behavior
                    .effectors()
                    .into_iter()
                    .filter(|s| !BUILTIN_EFFECTORS.iter().any(|(b, _)| *b == s.name)),
            );
        }
        Ok(specs)
    }

    /// Validate `params` and schedule the effector as a task.
    ///
    /// Validation failures are returned here and no task is created.
    pub fn invoke(
        &self,
        entity_id: &str,
        effector: &str,
        params: Params,
    ) -> Result<TaskHandle, EffectorError> {
        let spec = self
            .effectors(entity_id)?
            .into_iter()
            .find(|s| s.name == effector)
            .ok_or_else(|| EffectorError::UnknownEffector {
                entity: entity_id.to_string(),
                effector: effector.to_string(),
            })?;
        let params = spec.validate(params)?;
        let mgmt = self.me.upgrade().ok_or(EffectorError::ManagementStopped)?;

        let id = entity_id.to_string();
        let name = effector.to_string();
        Ok(self.tasks.submit(entity_id, effector, move |task| async move {
            match name.as_str() {
                "start" => mgmt.start_entity(&id).await.map(|_| Value::Null),
                "stop" => mgmt.stop_entity(&id).await.map(|_| Value::Null),
                "restart" => mgmt.restart_entity(&id).await.map(|_| Value::Null),
                _ => {
                    let behavior = mgmt
                        .behavior(&id)
                        .with_context(|| format!("entity '{}' has no behavior", id))?;
                    let ctx = EntityContext::new(&id, Arc::clone(&mgmt));
                    behavior.invoke_effector(&ctx, &task, &name, params).await
                }
            }
        }))
    }

    /// Drive an entity and then its children to RUNNING.
    ///
    /// A failure leaves the entity ON_FIRE and is returned to the caller.
    pub fn start_entity<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            ServiceStateLogic::set_expected(&self.store, entity_id, Lifecycle::Starting)?;

            let result = async {
                if let Some(behavior) = self.behavior(entity_id) {
                    let ctx = self.context(entity_id)?;
                    behavior.start(&ctx).await?;
                }
                for child in self.store.children(entity_id)? {
                    self.start_entity(&child)
                        .await
                        .with_context(|| format!("starting child '{}'", child))?;
                }
                Ok::<_, anyhow::Error>(())
            }
            .await;

            match result {
                Ok(()) => {
                    ServiceStateLogic::set_expected(&self.store, entity_id, Lifecycle::Running)?;
                    info!(entity_id = %entity_id, "Entity started");
                    Ok(())
                }
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %format!("{:#}", e), "Entity failed to start");
                    ServiceStateLogic::set_expected(&self.store, entity_id, Lifecycle::OnFire)?;
                    Err(e)
                }
            }
        }
        .boxed()
    }

    /// Stop children first, then the entity itself.
    pub fn stop_entity<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            ServiceStateLogic::set_expected(&self.store, entity_id, Lifecycle::Stopping)?;

            let result = async {
                for child in self.store.children(entity_id)? {
                    self.stop_entity(&child)
                        .await
                        .with_context(|| format!("stopping child '{}'", child))?;
                }
                if let Some(behavior) = self.behavior(entity_id) {
                    let ctx = self.context(entity_id)?;
                    behavior.stop(&ctx).await?;
                }
                Ok::<_, anyhow::Error>(())
            }
            .await;

            match result {
                Ok(()) => {
                    ServiceStateLogic::set_expected(&self.store, entity_id, Lifecycle::Stopped)?;
                    info!(entity_id = %entity_id, "Entity stopped");
                    Ok(())
                }
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %format!("{:#}", e), "Entity failed to stop");
                    ServiceStateLogic::set_expected(&self.store, entity_id, Lifecycle::OnFire)?;
                    Err(e)
                }
            }
        }
        .boxed()
    }

    pub async fn restart_entity(&self, entity_id: &str) -> anyhow::Result<()> {
        self.stop_entity(entity_id).await?;
        self.start_entity(entity_id).await
    }

    /// Run one reconciliation on a reconcilable entity; `None` for other entities.
    pub async fn reconcile(&self, entity_id: &str) -> Option<ReconcileOutcome> {
        let behavior = self.behavior(entity_id)?;
        let reconcilable = behavior.reconcilable()?;
        Some(reconcilable.reconcile().await)
    }

    /// Remove an entity and its subtree, releasing feeds, policies and subscriptions.
    ///
    /// Does not stop the entity's processes; stop it first for an orderly teardown.
    pub fn destroy(&self, entity_id: &str) -> Result<Vec<EntityId>, StoreError> {
        let mut subtree = Vec::new();
        self.collect_subtree(entity_id, &mut subtree)?;

        for id in &subtree {
            self.feeds.stop_all(id);
            self.policies.remove_all(id);
            self.behaviors.remove(id);
            self.tasks.forget_entity(id);
        }

        let removed = self.store.remove_entity(entity_id)?;
        info!(entity_id = %entity_id, removed = removed.len(), "Entity destroyed");
        Ok(removed)
    }

    fn collect_subtree(&self, entity_id: &str, out: &mut Vec<EntityId>) -> Result<(), StoreError> {
        for child in self.store.children(entity_id)? {
            self.collect_subtree(&child, out)?;
        }
        out.push(entity_id.to_string());
        Ok(())
    }

    fn context(&self, entity_id: &str) -> anyhow::Result<EntityContext> {
        let mgmt = self
            .me
            .upgrade()
            .context("management context is shutting down")?;
        Ok(EntityContext::new(entity_id, mgmt))
    }
}
