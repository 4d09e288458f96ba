//! Application registry: deploy, inspect and tear down applications
//! described by a declarative spec.
//!
//! An application is a root entity of type `application` with the application's
//! entities beneath it. Deploy and delete return immediately; starting and
//! tearing down run in the background.

use crate::lifecycle::{Lifecycle, ServiceStateLogic};
use crate::management::{ManagementContext, ManagementError};
use crate::state::{EntityId, NewEntity};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Name of another entity in the same application; the application root when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub name: String,
    #[serde(default)]
    pub entities: Vec<EntitySpec>,
    #[serde(default)]
    pub locations: BTreeSet<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Starting,
    Running,
    OnFire,
    Stopping,
    Stopped,
}

impl From<Lifecycle> for ApplicationStatus {
    fn from(state: Lifecycle) -> Self {
        match state {
            Lifecycle::Created | Lifecycle::Starting => ApplicationStatus::Starting,
            Lifecycle::Running => ApplicationStatus::Running,
            Lifecycle::OnFire => ApplicationStatus::OnFire,
            Lifecycle::Stopping => ApplicationStatus::Stopping,
            Lifecycle::Stopped => ApplicationStatus::Stopped,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ApplicationSummary {
    pub spec: ApplicationSpec,
    pub status: ApplicationStatus,
    #[serde(rename = "rootId")]
    pub root_id: EntityId,
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("application '{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid application spec: {0}")]
    InvalidSpec(String),

    #[error("application '{0}' not found")]
    NotFound(String),

    #[error("entity '{entity}' not found in application '{app}'")]
    EntityNotFound { app: String, entity: String },

    #[error("sensor '{sensor}' not set on '{entity}'")]
    SensorNotFound { entity: String, sensor: String },

    #[error(transparent)]
    Management(#[from] ManagementError),
}

#[derive(Clone)]
struct Application {
    spec: ApplicationSpec,
    root: EntityId,
    /// Entity name to id
    entities: BTreeMap<String, EntityId>,
    deleting: bool,
}

pub struct ApplicationRegistry {
    mgmt: Arc<ManagementContext>,
    apps: Arc<DashMap<String, Application>>,
}

impl ApplicationRegistry {
    pub fn new(mgmt: Arc<ManagementContext>) -> Self {
        Self {
            mgmt,
            apps: Arc::new(DashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Create the application's entities and start it in the background.
    pub fn deploy(&self, spec: ApplicationSpec) -> Result<ApplicationSummary, DeployError> {
        validate(&spec)?;

        let vacant = match self.apps.entry(spec.name.clone()) {
            Entry::Occupied(_) => return Err(DeployError::AlreadyExists(spec.name)),
            Entry::Vacant(vacant) => vacant,
        };

        let mut config = BTreeMap::new();
        config.insert(
            "locations".to_string(),
            Value::Array(spec.locations.iter().cloned().map(Value::String).collect()),
        );
        let root = self.mgmt.create_entity(NewEntity {
            entity_type: "application".to_string(),
            name: spec.name.clone(),
            config,
            ..Default::default()
        })?;

        let mut entities = BTreeMap::new();
        for entity in &spec.entities {
            let parent = match &entity.parent {
                Some(name) => entities.get(name).cloned(),
                None => Some(root.clone()),
            };
            let created = self.mgmt.create_entity(NewEntity {
                parent,
                entity_type: entity.entity_type.clone(),
                name: entity.name.clone(),
                config: entity.config.clone(),
                ..Default::default()
            });
            match created {
                Ok(id) => {
                    entities.insert(entity.name.clone(), id);
                }
                Err(e) => {
                    warn!(app = %spec.name, entity = %entity.name, error = %e, "Deploy failed");
                    let _ = self.mgmt.destroy(&root);
                    return Err(e.into());
                }
            }
        }

        let app = Application {
            spec,
            root: root.clone(),
            entities,
            deleting: false,
        };
        let summary = self.summarize(&app);
        vacant.insert(app);
        info!(app = %summary.spec.name, root_id = %root, "Application deployed");

        let mgmt = Arc::clone(&self.mgmt);
        tokio::spawn(async move {
            if let Err(e) = mgmt.start_entity(&root).await {
                warn!(root_id = %root, error = %format!("{:#}", e), "Application failed to start");
            }
        });

        Ok(summary)
    }

    pub fn get(&self, name: &str) -> Option<ApplicationSummary> {
        self.apps.get(name).map(|app| self.summarize(&app))
    }

    /// All applications, sorted by name
    pub fn list(&self) -> Vec<ApplicationSummary> {
        let mut apps: Vec<ApplicationSummary> =
            self.apps.iter().map(|app| self.summarize(&app)).collect();
        apps.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        apps
    }

    /// Entity id of a named entity in an application
    pub fn entity_id(&self, app: &str, entity: &str) -> Result<EntityId, DeployError> {
        let found = self.apps.get(app).ok_or_else(|| DeployError::NotFound(app.to_string()))?;
        found
            .entities
            .get(entity)
            .cloned()
            .ok_or_else(|| DeployError::EntityNotFound {
                app: app.to_string(),
                entity: entity.to_string(),
            })
    }

    /// Entity name to the read URIs of each sensor it currently has
    pub fn sensors(&self, app: &str) -> Result<BTreeMap<String, BTreeSet<String>>, DeployError> {
        let found = self.apps.get(app).ok_or_else(|| DeployError::NotFound(app.to_string()))?;
        let store = self.mgmt.store();
        Ok(found
            .entities
            .iter()
            .map(|(name, id)| {
                let uris = store
                    .attributes(id)
                    .unwrap_or_default()
                    .into_keys()
                    .map(|sensor| format!("/applications/{}/sensors/{}/{}", app, name, sensor))
                    .collect();
                (name.clone(), uris)
            })
            .collect())
    }

    pub fn read_sensor(&self, app: &str, entity: &str, sensor: &str) -> Result<Value, DeployError> {
        let id = self.entity_id(app, entity)?;
        self.mgmt
            .store()
            .get_attribute(&id, sensor)
            .ok_or_else(|| DeployError::SensorNotFound {
                entity: entity.to_string(),
                sensor: sensor.to_string(),
            })
    }

    /// Begin tearing the application down: stop, then destroy, then forget it.
    pub fn delete(&self, name: &str) -> Result<(), DeployError> {
        let root = {
            let mut app = self
                .apps
                .get_mut(name)
                .ok_or_else(|| DeployError::NotFound(name.to_string()))?;
            if app.deleting {
                return Ok(());
            }
            app.deleting = true;
            app.root.clone()
        };
        info!(app = %name, root_id = %root, "Application teardown requested");

        let mgmt = Arc::clone(&self.mgmt);
        let apps = Arc::clone(&self.apps);
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = mgmt.stop_entity(&root).await {
                warn!(app = %name, error = %format!("{:#}", e), "Application did not stop cleanly");
            }
            if let Err(e) = mgmt.destroy(&root) {
                warn!(app = %name, error = %e, "Destroying application failed");
            }
            apps.remove(&name);
            info!(app = %name, "Application removed");
        });
        Ok(())
    }

    fn summarize(&self, app: &Application) -> ApplicationSummary {
        let state = ServiceStateLogic::state(self.mgmt.store(), &app.root);
        let status = match state {
            Some(state) => state.into(),
            None if app.deleting => ApplicationStatus::Stopped,
            None => ApplicationStatus::Starting,
        };
        ApplicationSummary {
            spec: app.spec.clone(),
            status,
            root_id: app.root.clone(),
        }
    }
}

fn validate(spec: &ApplicationSpec) -> Result<(), DeployError> {
    if spec.name.trim().is_empty() {
        return Err(DeployError::InvalidSpec("name must not be empty".to_string()));
    }
    let mut seen = BTreeSet::new();
    for entity in &spec.entities {
        if entity.name.trim().is_empty() {
            return Err(DeployError::InvalidSpec("entity names must not be empty".to_string()));
        }
        if let Some(parent) = &entity.parent {
            if !seen.contains(parent) {
                return Err(DeployError::InvalidSpec(format!(
                    "parent '{}' of '{}' must be declared before it",
                    parent, entity.name
                )));
            }
        }
        if !seen.insert(entity.name.clone()) {
            return Err(DeployError::InvalidSpec(format!(
                "duplicate entity name '{}'",
                entity.name
            )));
        }
    }
    Ok(())
}
