//! Policies: stateful listeners bound to one entity.
//!
//! A policy registers its subscriptions in [`Policy::attach`] through a
//! [`PolicyContext`]. Every subscription is owned by the policy's id, so
//! detaching a policy (or destroying its entity) drops them all at once.

mod membership;
mod notifier;

pub use membership::{MembershipEvent, MembershipTracker};
pub use notifier::HttpNotifierPolicy;

use crate::effector::{EffectorError, Params, TaskHandle};
use crate::management::ManagementContext;
use crate::state::{EntityId, EntityStore, SensorEvent};
use crate::subscription::{EntitySelector, SensorFilter, SubscriptionHandle};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{info, warn};

/// Policy attachment errors
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("entity '{0}' not found")]
    EntityNotFound(EntityId),

    #[error("policy '{policy}' failed to attach: {source:#}")]
    AttachFailed {
        policy: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A reactive listener attached to one entity.
///
/// Callbacks of one subscription run one at a time; callbacks of different
/// subscriptions may run concurrently, so state shared between them needs a lock.
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    /// Register subscriptions. Events published before this call are not replayed.
    fn attach(self: Arc<Self>, ctx: &PolicyContext) -> anyhow::Result<()>;

    /// Called after the policy's subscriptions have been dropped
    fn on_detach(&self, _ctx: &PolicyContext) {}
}

/// What a policy can reach while attached
#[derive(Clone)]
pub struct PolicyContext {
    policy_id: String,
    entity_id: EntityId,
    store: Arc<EntityStore>,
    mgmt: Weak<ManagementContext>,
}

impl PolicyContext {
    pub fn policy_id(&self) -> &str {
        &self.policy_id
    }

    /// Entity the policy is attached to
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Subscribe on behalf of this policy
    pub fn subscribe<F>(
        &self,
        selector: EntitySelector,
        filter: SensorFilter,
        callback: F,
    ) -> SubscriptionHandle
    where
        F: Fn(&SensorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.store
            .bus()
            .subscribe(self.policy_id.clone(), selector, filter, callback)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.store.bus().unsubscribe(handle)
    }

    /// Fire-and-forget effector invocation; the returned task can be awaited if needed.
    pub fn invoke(
        &self,
        entity_id: &str,
        effector: &str,
        params: Params,
    ) -> Result<TaskHandle, EffectorError> {
        let mgmt = self.mgmt.upgrade().ok_or(EffectorError::ManagementStopped)?;
        mgmt.invoke(entity_id, effector, params)
    }
}

/// Listing entry for an attached policy
#[derive(Clone, Debug, Serialize)]
pub struct PolicySummary {
    pub id: String,
    pub name: String,
}

struct AttachedPolicy {
    policy: Arc<dyn Policy>,
    ctx: PolicyContext,
}

/// Tracks which policies are attached to which entity
pub struct PolicyHost {
    store: Arc<EntityStore>,
    mgmt: Weak<ManagementContext>,
    attached: DashMap<EntityId, Vec<AttachedPolicy>>,
}

impl PolicyHost {
    pub fn new(store: Arc<EntityStore>, mgmt: Weak<ManagementContext>) -> Self {
        Self {
            store,
            mgmt,
            attached: DashMap::new(),
        }
    }

    /// Attach `policy` to `entity_id` and return the new policy id.
    ///
    /// If `attach` fails, any subscriptions it already made are dropped.
    pub fn add_policy(
        &self,
        entity_id: &str,
        policy: Arc<dyn Policy>,
    ) -> Result<String, PolicyError> {
        if !self.store.contains(entity_id) {
            return Err(PolicyError::EntityNotFound(entity_id.to_string()));
        }

        let ctx = PolicyContext {
            policy_id: format!("policy-{}", uuid::Uuid::now_v7()),
            entity_id: entity_id.to_string(),
            store: Arc::clone(&self.store),
            mgmt: self.mgmt.clone(),
        };

        if let Err(source) = Arc::clone(&policy).attach(&ctx) {
            self.store.bus().unsubscribe_all(&ctx.policy_id);
            warn!(
                entity_id = %entity_id,
                policy = %policy.name(),
                error = %source,
                "Policy attach failed"
            );
            return Err(PolicyError::AttachFailed {
                policy: policy.name().to_string(),
                source,
            });
        }

        let policy_id = ctx.policy_id.clone();
        info!(
            entity_id = %entity_id,
            policy = %policy.name(),
            policy_id = %policy_id,
            "Policy attached"
        );
        self.attached
            .entry(entity_id.to_string())
            .or_default()
            .push(AttachedPolicy { policy, ctx });

        Ok(policy_id)
    }

    /// Detach one policy; returns whether it was attached.
    pub fn remove_policy(&self, entity_id: &str, policy_id: &str) -> bool {
        let detached = self.attached.get_mut(entity_id).and_then(|mut list| {
            let index = list.iter().position(|p| p.ctx.policy_id == policy_id)?;
            Some(list.remove(index))
        });

        match detached {
            Some(attached) => {
                detach(attached);
                true
            }
            None => false,
        }
    }

    /// Detach every policy of `entity_id`; returns how many were detached.
    pub fn remove_all(&self, entity_id: &str) -> usize {
        let detached = self
            .attached
            .remove(entity_id)
            .map(|(_, list)| list)
            .unwrap_or_default();
        let count = detached.len();
        detached.into_iter().for_each(detach);
        count
    }

    pub fn policies_of(&self, entity_id: &str) -> Vec<PolicySummary> {
        self.attached
            .get(entity_id)
            .map(|list| {
                list.iter()
                    .map(|p| PolicySummary {
                        id: p.ctx.policy_id.clone(),
                        name: p.policy.name().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn detach(attached: AttachedPolicy) {
    let dropped = attached
        .ctx
        .store
        .bus()
        .unsubscribe_all(&attached.ctx.policy_id);
    attached.policy.on_detach(&attached.ctx);
    info!(
        entity_id = %attached.ctx.entity_id,
        policy = %attached.policy.name(),
        subscriptions = dropped,
        "Policy detached"
    );
}
