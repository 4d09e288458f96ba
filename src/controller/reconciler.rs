use crate::controller::driver::ProxyDriver;
use crate::controller::mapping::mapping_view;
use crate::controller::ssl::ProxySslConfig;
use crate::controller::template::{MappingView, RenderError, RenderInput, TemplateRenderer};
use crate::controller::{PROXY_CONFIG_GENERATION, PROXY_RECONCILE_OUTCOME};
use crate::state::sensor::HOST_ENDPOINT;
use crate::state::{to_value, EntityId, EntityStore};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Step a reconciliation failed at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStage {
    Render,
    InstallSsl,
    WriteConfig,
    Reload,
}

/// Result of one reconciliation run, also published as `proxy.reconcile.lastOutcome`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Config written and reload issued
    Applied { generation: u64 },
    /// Nothing to reconcile against yet; not an error
    NotReady { reason: String },
    /// Steps before `stage` stay applied; the next run converges
    Failed { stage: ReconcileStage, error: String },
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileOutcome::Applied { generation } => write!(f, "applied generation {}", generation),
            ReconcileOutcome::NotReady { reason } => write!(f, "not ready: {}", reason),
            ReconcileOutcome::Failed { stage, error } => write!(f, "failed at {:?}: {}", stage, error),
        }
    }
}

/// Static inputs of a controller, fixed at creation
#[derive(Clone, Debug, Default)]
pub struct ReconcileSettings {
    pub port: u16,
    pub ssl: Option<ProxySslConfig>,
    /// Group whose members' `host.endpoint` form the default backend
    pub server_pool: Option<EntityId>,
    /// Group of url-mapping entities
    pub url_mappings: Option<EntityId>,
    pub globals: BTreeMap<String, String>,
    pub template: String,
}

#[derive(Default)]
struct ControllerState {
    needed: bool,
    running: bool,
    /// TLS material ids already installed; never installed twice
    installed: BTreeSet<String>,
    driver: Option<Arc<dyn ProxyDriver>>,
    generation: u64,
}

/// Reconciles one proxy's configuration against its members.
///
/// Triggers arriving while a run is in progress collapse into exactly one
/// follow-up run. Runs never overlap, whether started by a trigger or by an
/// explicit [`reconcile`](Self::reconcile) call.
pub struct Reconciler {
    entity_id: EntityId,
    store: Arc<EntityStore>,
    renderer: Arc<dyn TemplateRenderer>,
    settings: ReconcileSettings,
    state: Mutex<ControllerState>,
    run_lock: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(
        entity_id: &str,
        store: Arc<EntityStore>,
        renderer: Arc<dyn TemplateRenderer>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            store,
            renderer,
            settings,
            state: Mutex::new(ControllerState::default()),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    pub fn attach_driver(&self, driver: Arc<dyn ProxyDriver>) {
        self.lock().driver = Some(driver);
    }

    /// Wait for any in-flight run to finish, then detach the driver.
    ///
    /// Once this returns no run touches the detached driver or publishes an outcome,
    /// unless [`reconcile`](Self::reconcile) is called explicitly.
    pub async fn shutdown(&self) -> Option<Arc<dyn ProxyDriver>> {
        let _run = self.run_lock.lock().await;
        let mut state = self.lock();
        state.needed = false;
        state.driver.take()
    }

    pub fn driver(&self) -> Option<Arc<dyn ProxyDriver>> {
        self.lock().driver.clone()
    }

    pub fn installed_ids(&self) -> BTreeSet<String> {
        self.lock().installed.clone()
    }

    /// Number of successfully applied configurations
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Current members and settings, as the renderer will see them
    pub fn gather(&self) -> RenderInput {
        let mut pool = BTreeSet::new();
        if let Some(group) = &self.settings.server_pool {
            for member in self.store.members(group).unwrap_or_default() {
                if let Some(endpoint) = self.store.get(&member, &HOST_ENDPOINT) {
                    pool.insert(endpoint);
                }
            }
        }

        let mut mappings: Vec<MappingView> = Vec::new();
        if let Some(group) = &self.settings.url_mappings {
            mappings = self
                .store
                .members(group)
                .unwrap_or_default()
                .iter()
                .filter_map(|id| mapping_view(&self.store, id))
                .filter(|m| !m.addresses.is_empty())
                .collect();
            mappings.sort_by(|a, b| {
                (&a.domain, &a.path, &a.id).cmp(&(&b.domain, &b.path, &b.id))
            });
        }

        let mut domains: BTreeMap<String, Vec<MappingView>> = BTreeMap::new();
        for mapping in &mappings {
            domains
                .entry(mapping.domain.clone())
                .or_default()
                .push(mapping.clone());
        }

        RenderInput {
            port: self.settings.port,
            ssl: self.settings.ssl.clone(),
            pool,
            mappings,
            domains,
            globals: self.settings.globals.clone(),
        }
    }

    /// Render the configuration for the current state without applying it
    pub fn render(&self) -> Result<String, RenderError> {
        let input = self.gather();
        input.validate()?;
        self.renderer.render(&self.settings.template, &input)
    }

    /// Request a run. Starts one if idle; otherwise marks one follow-up run.
    pub fn trigger(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            state.needed = true;
            if state.running {
                return;
            }
            state.running = true;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                {
                    let mut state = this.lock();
                    if !state.needed {
                        state.running = false;
                        break;
                    }
                    state.needed = false;
                }
                let run = AssertUnwindSafe(this.run(true)).catch_unwind().await;
                if run.is_err() {
                    warn!(entity_id = %this.entity_id, "Proxy reconcile panicked");
                }
            }
        });
    }

    /// Run one reconciliation: gather, render, install TLS material, write, reload.
    pub async fn reconcile(&self) -> ReconcileOutcome {
        self.run(false).await
    }

    /// Triggered runs stay silent when there is no driver, so a run queued
    /// behind [`shutdown`](Self::shutdown) publishes nothing.
    async fn run(&self, triggered: bool) -> ReconcileOutcome {
        let _run = self.run_lock.lock().await;

        let driver = self.driver();
        let Some(driver) = driver else {
            let outcome = ReconcileOutcome::NotReady {
                reason: "no driver attached".to_string(),
            };
            if triggered {
                debug!(entity_id = %self.entity_id, "Triggered reconcile without a driver");
                return outcome;
            }
            return self.finish(outcome);
        };
        if !driver.is_customization_complete() {
            return self.finish(ReconcileOutcome::NotReady {
                reason: "driver customization not complete".to_string(),
            });
        }

        let input = self.gather();
        let rendered = input
            .validate()
            .and_then(|_| self.renderer.render(&self.settings.template, &input));
        let config = match rendered {
            Ok(config) => config,
            Err(e) => return self.failed(ReconcileStage::Render, e.to_string()),
        };

        let workdir = driver.working_directory();
        for (id, ssl) in input.ssl_material() {
            let already = self.lock().installed.contains(&id);
            if already {
                continue;
            }
            for (source, dest) in ssl.installs(&id, &workdir) {
                let installed = match driver.fetch_resource(&source).await {
                    Ok(bytes) => driver.copy_file(&bytes, &dest).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = installed {
                    return self.failed(ReconcileStage::InstallSsl, e.to_string());
                }
            }
            debug!(entity_id = %self.entity_id, ssl_id = %id, "TLS material installed");
            self.lock().installed.insert(id);
        }

        let path: PathBuf = workdir.join("conf").join("server.conf");
        if let Err(e) = driver.copy_file(config.as_bytes(), &path).await {
            return self.failed(ReconcileStage::WriteConfig, e.to_string());
        }
        if let Err(e) = driver.reload().await {
            return self.failed(ReconcileStage::Reload, e.to_string());
        }

        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.generation
        };
        self.finish(ReconcileOutcome::Applied { generation })
    }

    fn failed(&self, stage: ReconcileStage, error: String) -> ReconcileOutcome {
        self.finish(ReconcileOutcome::Failed { stage, error })
    }

    fn finish(&self, outcome: ReconcileOutcome) -> ReconcileOutcome {
        match &outcome {
            ReconcileOutcome::Applied { .. } => {
                info!(entity_id = %self.entity_id, outcome = %outcome, "Proxy reconciled")
            }
            ReconcileOutcome::NotReady { .. } => {
                debug!(entity_id = %self.entity_id, outcome = %outcome, "Proxy reconcile skipped")
            }
            ReconcileOutcome::Failed { .. } => {
                warn!(entity_id = %self.entity_id, outcome = %outcome, "Proxy reconcile failed")
            }
        }

        let mut writes = Vec::with_capacity(2);
        if let ReconcileOutcome::Applied { generation } = &outcome {
            if let Ok(v) = to_value(PROXY_CONFIG_GENERATION.name(), generation) {
                writes.push((PROXY_CONFIG_GENERATION.name().to_string(), v));
            }
        }
        if let Ok(v) = to_value(PROXY_RECONCILE_OUTCOME.name(), &outcome) {
            writes.push((PROXY_RECONCILE_OUTCOME.name().to_string(), v));
        }
        if let Err(e) = self.store.set_attributes(&self.entity_id, writes) {
            debug!(entity_id = %self.entity_id, error = %e, "Could not publish reconcile outcome");
        }
        outcome
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
