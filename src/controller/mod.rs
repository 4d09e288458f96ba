//! Reverse-proxy controller: keeps a generated proxy configuration in step
//! with a changing pool of backends and url mappings.

pub mod driver;
mod mapping;
mod reconciler;
pub mod ssl;
pub mod template;

pub use driver::{DriverError, DriverFactory, LocalDriverFactory, LocalProcessDriver, ProxyDriver};
pub use mapping::{mapping_view, UrlMapping, TARGET_ADDRESSES};
pub use reconciler::{ReconcileOutcome, ReconcileSettings, ReconcileStage, Reconciler};
pub use ssl::ProxySslConfig;
pub use template::{BuiltinRenderer, RenderError, RenderInput, TemplateRenderer, DEFAULT_TEMPLATE};

use crate::config::ProxyConfig;
use crate::effector::{EffectorSpec, ParameterSpec, ParameterType, Params, TaskContext};
use crate::entity::{EntityBehavior, EntityCatalog, EntityContext, Reconcilable};
use crate::feed::HttpPollSource;
use crate::lifecycle::ServiceStateLogic;
use crate::policy::MembershipTracker;
use crate::state::sensor::{HOST_ENDPOINT, MAIN_URI};
use crate::state::{EntityId, EntityStore, Sensor};
use crate::subscription::SubscriptionHandle;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PROXY_URL_ANSWERS_NICELY: Sensor<bool> = Sensor::new(
    "proxy.url.answersNicely",
    "Whether the proxy's main URI answers HTTP requests",
);

pub const PROXY_CONFIG_GENERATION: Sensor<u64> = Sensor::new(
    "proxy.config.generation",
    "Number of configurations written and reloaded",
);

pub const PROXY_RECONCILE_OUTCOME: Sensor<ReconcileOutcome> = Sensor::new(
    "proxy.reconcile.lastOutcome",
    "Outcome of the most recent reconciliation run",
);

const HEALTH_FEED: &str = "proxy-poll";

/// Defaults shared by every controller created from the catalog
#[derive(Clone, Debug)]
pub struct ProxySettings {
    pub port: u16,
    pub poll_period: Duration,
    pub template_path: Option<PathBuf>,
}

impl From<&ProxyConfig> for ProxySettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            port: config.port,
            poll_period: Duration::from_millis(config.poll_period_ms),
            template_path: config.template_path.clone(),
        }
    }
}

/// Register the proxy entity types with a catalog
pub fn register_types(catalog: &EntityCatalog, config: &ProxyConfig) {
    let settings = ProxySettings::from(config);
    let drivers: Arc<dyn DriverFactory> = Arc::new(LocalDriverFactory::new(
        config.run_dir.clone(),
        config.reload_command.clone(),
    ));
    catalog.register("proxy-controller", move || {
        Arc::new(ProxyController::new(settings.clone(), Arc::clone(&drivers)))
    });
    catalog.register("url-mapping", || Arc::new(UrlMapping));
}

#[derive(Default)]
struct Attachments {
    policies: Vec<String>,
    indicator: Option<SubscriptionHandle>,
}

/// Load balancer in front of a server pool and a set of url mappings.
///
/// Config keys: `port`, `host`, `url`, `serverPool`, `urlMappings`, `ssl`,
/// `globals`, `template`. Group references may be entity ids or names of
/// entities in the same application.
pub struct ProxyController {
    settings: ProxySettings,
    drivers: Arc<dyn DriverFactory>,
    renderer: Arc<dyn TemplateRenderer>,
    reconciler: OnceLock<Arc<Reconciler>>,
    attachments: Mutex<Attachments>,
}

impl ProxyController {
    pub fn new(settings: ProxySettings, drivers: Arc<dyn DriverFactory>) -> Self {
        Self {
            settings,
            drivers,
            renderer: Arc::new(BuiltinRenderer),
            reconciler: OnceLock::new(),
            attachments: Mutex::new(Attachments::default()),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Set once `init` has run
    pub fn reconciler(&self) -> Option<&Arc<Reconciler>> {
        self.reconciler.get()
    }

    fn require_reconciler(&self) -> anyhow::Result<&Arc<Reconciler>> {
        self.reconciler
            .get()
            .context("proxy controller has not been initialised")
    }

    fn attachments(&self) -> std::sync::MutexGuard<'_, Attachments> {
        self.attachments.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn template(&self, ctx: &EntityContext) -> anyhow::Result<String> {
        if let Some(template) = ctx.config::<String>("template") {
            return Ok(template);
        }
        match &self.settings.template_path {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("reading proxy template {}", path.display())),
            None => Ok(DEFAULT_TEMPLATE.to_string()),
        }
    }

    async fn deploy(&self, reconciler: &Reconciler, url: &str) -> anyhow::Result<Value> {
        let Some(driver) = reconciler.driver() else {
            warn!(url = %url, "Deploy requested while the proxy has no driver");
            return Ok(Value::Null);
        };
        let name = url
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("archive");
        let content = driver.fetch_resource(url).await?;
        let dest = driver.working_directory().join("content").join(name);
        driver.copy_file(&content, &dest).await?;
        info!(url = %url, path = %dest.display(), "Archive deployed");
        Ok(Value::String(dest.display().to_string()))
    }
}

/// Resolve a group reference to an entity id: either an id, or the name of an
/// entity under the same application root as `from`.
fn resolve_entity(store: &EntityStore, from: &str, reference: &str) -> Option<EntityId> {
    if store.contains(reference) {
        return Some(reference.to_string());
    }
    let root = store.lineage(from).ok()?.pop()?;
    store
        .get_all_entities()
        .into_iter()
        .filter(|e| e.name == reference)
        .find(|e| {
            store
                .lineage(&e.id)
                .ok()
                .and_then(|mut l| l.pop())
                .as_deref()
                == Some(root.as_str())
        })
        .map(|e| e.id)
}

#[async_trait]
impl EntityBehavior for ProxyController {
    fn type_name(&self) -> &str {
        "proxy-controller"
    }

    fn effectors(&self) -> Vec<EffectorSpec> {
        vec![
            EffectorSpec::new("reload", "Make the proxy process pick up its configuration"),
            EffectorSpec::new("update", "Reconcile the configuration now"),
            EffectorSpec::new("getCurrentConfiguration", "Render the configuration without applying it"),
            EffectorSpec::new("deploy", "Fetch an archive into the proxy's content directory")
                .param(ParameterSpec::required("url", ParameterType::String)),
        ]
    }

    fn init(&self, ctx: &EntityContext) -> anyhow::Result<()> {
        let store = ctx.store();
        let group = |key: &str| -> anyhow::Result<Option<EntityId>> {
            match ctx.config::<String>(key) {
                Some(reference) => resolve_entity(store, ctx.entity_id(), &reference)
                    .map(Some)
                    .with_context(|| format!("{} '{}' not found", key, reference)),
                None => Ok(None),
            }
        };

        let settings = ReconcileSettings {
            port: ctx.config("port").unwrap_or(self.settings.port),
            ssl: ctx.config("ssl"),
            server_pool: group("serverPool")?,
            url_mappings: group("urlMappings")?,
            globals: ctx.config::<BTreeMap<String, String>>("globals").unwrap_or_default(),
            template: self.template(ctx)?,
        };

        let reconciler = Reconciler::new(
            ctx.entity_id(),
            Arc::clone(store),
            Arc::clone(&self.renderer),
            settings,
        );
        if self.reconciler.set(Arc::new(reconciler)).is_err() {
            anyhow::bail!("proxy controller initialised twice");
        }
        Ok(())
    }

    async fn start(&self, ctx: &EntityContext) -> anyhow::Result<()> {
        let reconciler = self.require_reconciler()?;
        let id = ctx.entity_id().to_string();

        let driver = self.drivers.create(&id);
        driver.launch().await.context("launching proxy")?;
        reconciler.attach_driver(driver);

        let port = reconciler.settings().port;
        let host: String = ctx.config("host").unwrap_or_else(|| "127.0.0.1".to_string());
        let uri = ctx
            .config::<String>("url")
            .unwrap_or_else(|| format!("http://{}:{}/", host, port));
        ctx.set(&MAIN_URI, &uri)?;

        let indicator = ServiceStateLogic::connect_indicator(
            ctx.store(),
            &id,
            &id,
            PROXY_URL_ANSWERS_NICELY,
            "No response from proxy yet",
            "URL where the proxy listens is not answering",
        )?;

        let reader = Arc::clone(ctx.store());
        let target = id.clone();
        let probe = HttpPollSource::answering(move || reader.get(&target, &MAIN_URI));
        ctx.mgmt().feeds().start(
            &id,
            HEALTH_FEED,
            PROXY_URL_ANSWERS_NICELY.name(),
            self.settings.poll_period,
            Arc::new(probe),
        );

        let mut policies = Vec::new();
        let groups = [
            (&reconciler.settings().server_pool, HOST_ENDPOINT.name()),
            (&reconciler.settings().url_mappings, TARGET_ADDRESSES.name()),
        ];
        for (group, sensor) in groups {
            let Some(group) = group else { continue };
            let trigger = Arc::clone(reconciler);
            let tracker = MembershipTracker::new(group, move |event| {
                debug!(event = ?event, "Proxy membership change");
                trigger.trigger();
            })
            .track_sensor(sensor);
            policies.push(ctx.add_policy(Arc::new(tracker))?);
        }

        {
            let mut attachments = self.attachments();
            attachments.policies = policies;
            attachments.indicator = Some(indicator);
        }

        reconciler.trigger();
        info!(entity_id = %id, uri = %uri, "Proxy controller started");
        Ok(())
    }

    async fn stop(&self, ctx: &EntityContext) -> anyhow::Result<()> {
        let id = ctx.entity_id();
        let attachments = std::mem::take(&mut *self.attachments());
        for policy_id in &attachments.policies {
            ctx.mgmt().policies().remove_policy(id, policy_id);
        }
        if let Some(handle) = attachments.indicator {
            ctx.store().bus().unsubscribe(handle);
        }
        ctx.mgmt().feeds().stop(id, HEALTH_FEED);
        ServiceStateLogic::update_not_up_indicator(
            ctx.store(),
            id,
            PROXY_URL_ANSWERS_NICELY.name(),
            None,
        )?;

        let driver = match self.reconciler() {
            Some(reconciler) => reconciler.shutdown().await,
            None => None,
        };
        if let Some(driver) = driver {
            driver.stop().await.context("stopping proxy")?;
        }
        Ok(())
    }

    async fn invoke_effector(
        &self,
        _ctx: &EntityContext,
        _task: &TaskContext,
        name: &str,
        params: Params,
    ) -> anyhow::Result<Value> {
        let reconciler = self.require_reconciler()?;
        match name {
            "reload" => {
                let driver = reconciler
                    .driver()
                    .context("cannot reload: proxy has no driver")?;
                driver.reload().await?;
                Ok(Value::Null)
            }
            "update" => match reconciler.reconcile().await {
                ReconcileOutcome::Failed { stage, error } => {
                    anyhow::bail!("reconcile failed at {:?}: {}", stage, error)
                }
                outcome => Ok(serde_json::to_value(outcome)?),
            },
            "getCurrentConfiguration" => Ok(Value::String(reconciler.render()?)),
            "deploy" => {
                let url = params
                    .get("url")
                    .and_then(Value::as_str)
                    .context("deploy needs a url")?;
                self.deploy(reconciler, url).await
            }
            other => anyhow::bail!("proxy-controller has no effector '{}'", other),
        }
    }

    fn reconcilable(&self) -> Option<&dyn Reconcilable> {
        Some(self)
    }
}

#[async_trait]
impl Reconcilable for ProxyController {
    fn request_reconcile(&self) {
        if let Some(reconciler) = self.reconciler() {
            reconciler.trigger();
        }
    }

    async fn reconcile(&self) -> ReconcileOutcome {
        match self.reconciler() {
            Some(reconciler) => reconciler.reconcile().await,
            None => ReconcileOutcome::NotReady {
                reason: "controller not initialised".to_string(),
            },
        }
    }
}
