use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use steward::config::StewardConfig;
use steward::controller::{
    BuiltinRenderer, DriverError, DriverFactory, ProxyController, ProxyDriver, ProxySettings,
    ProxySslConfig, ReconcileOutcome, ReconcileSettings, ReconcileStage, Reconciler,
    RenderError, RenderInput, TemplateRenderer, DEFAULT_TEMPLATE, PROXY_CONFIG_GENERATION,
    TARGET_ADDRESSES,
};
use steward::effector::{Params, TaskState};
use steward::lifecycle::Lifecycle;
use steward::management::ManagementContext;
use steward::state::sensor::{HOST_ENDPOINT, SERVICE_STATE};
use steward::state::{EntityId, EntityStore, NewEntity};
use steward::subscription::SubscriptionRegistry;
use tokio::sync::Semaphore;

const WORKDIR: &str = "/proxy";

/// Driver that keeps files in memory and records every action
#[derive(Default)]
struct RecordingDriver {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    config_writes: AtomicUsize,
    fetches: Mutex<Vec<String>>,
    reloads: AtomicUsize,
    customized: AtomicBool,
    /// When set, each reload waits for one permit
    reload_gate: Option<Arc<Semaphore>>,
    /// When set, each config write waits for one permit
    write_gate: Option<Arc<Semaphore>>,
    write_attempts: AtomicUsize,
}

impl RecordingDriver {
    fn ready() -> Self {
        let driver = Self::default();
        driver.customized.store(true, Ordering::SeqCst);
        driver
    }

    fn config(&self) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&Path::new(WORKDIR).join("conf/server.conf"))
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProxyDriver for RecordingDriver {
    async fn copy_file(&self, content: &[u8], remote_path: &Path) -> Result<(), DriverError> {
        if remote_path.ends_with("server.conf") {
            self.write_attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.write_gate {
                gate.acquire().await.unwrap().forget();
            }
            self.config_writes.fetch_add(1, Ordering::SeqCst);
        }
        self.files
            .lock()
            .unwrap()
            .insert(remote_path.to_path_buf(), content.to_vec());
        Ok(())
    }

    fn working_directory(&self) -> PathBuf {
        PathBuf::from(WORKDIR)
    }

    fn is_customization_complete(&self) -> bool {
        self.customized.load(Ordering::SeqCst)
    }

    async fn reload(&self) -> Result<(), DriverError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.reload_gate {
            gate.acquire().await.unwrap().forget();
        }
        Ok(())
    }

    async fn fetch_resource(&self, url: &str) -> Result<Vec<u8>, DriverError> {
        self.fetches.lock().unwrap().push(url.to_string());
        Ok(format!("material from {}", url).into_bytes())
    }

    async fn launch(&self) -> Result<(), DriverError> {
        self.customized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.customized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct RecordingFactory {
    driver: Arc<RecordingDriver>,
}

impl DriverFactory for RecordingFactory {
    fn create(&self, _entity_id: &str) -> Arc<dyn ProxyDriver> {
        Arc::clone(&self.driver) as Arc<dyn ProxyDriver>
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn store() -> Arc<EntityStore> {
    Arc::new(EntityStore::new(Arc::new(SubscriptionRegistry::new())))
}

fn entity(store: &EntityStore, parent: Option<&str>, name: &str, config: Value) -> EntityId {
    let config = match config {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    };
    store
        .create_entity(NewEntity {
            parent: parent.map(str::to_string),
            entity_type: "test".to_string(),
            name: name.to_string(),
            config,
            ..Default::default()
        })
        .unwrap()
}

fn addresses(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|a| a.to_string()).collect()
}

struct Fixture {
    store: Arc<EntityStore>,
    pool: EntityId,
    mappings: EntityId,
    reconciler: Arc<Reconciler>,
}

fn fixture(ssl: Option<ProxySslConfig>) -> Fixture {
    let store = store();
    let controller = entity(&store, None, "proxy", json!({}));
    let pool = entity(&store, None, "pool", json!({}));
    let mappings = entity(&store, None, "mappings", json!({}));

    let a = entity(&store, Some(&pool), "a", json!({}));
    store.set(&a, &HOST_ENDPOINT, &"10.0.0.1:8080".to_string()).unwrap();
    let b = entity(&store, Some(&pool), "b", json!({}));
    store.set(&b, &HOST_ENDPOINT, &"10.0.0.2:8080".to_string()).unwrap();

    let reconciler = Arc::new(Reconciler::new(
        &controller,
        Arc::clone(&store),
        Arc::new(BuiltinRenderer),
        ReconcileSettings {
            port: 8000,
            ssl,
            server_pool: Some(pool.clone()),
            url_mappings: Some(mappings.clone()),
            globals: BTreeMap::new(),
            template: DEFAULT_TEMPLATE.to_string(),
        },
    ));

    Fixture {
        store,
        pool,
        mappings,
        reconciler,
    }
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let fx = fixture(Some(ProxySslConfig {
        certificate_source_url: Some("http://certs/global.crt".to_string()),
        ..Default::default()
    }));
    let driver = Arc::new(RecordingDriver::ready());
    fx.reconciler.attach_driver(driver.clone());

    assert_eq!(
        fx.reconciler.reconcile().await,
        ReconcileOutcome::Applied { generation: 1 }
    );
    let first = driver.config().unwrap();
    assert!(first.contains("server pool_0 10.0.0.1:8080 check"));
    assert!(first.contains("server pool_1 10.0.0.2:8080 check"));
    assert!(first.contains("bind *:8000 ssl crt global.crt"));

    assert_eq!(
        fx.reconciler.reconcile().await,
        ReconcileOutcome::Applied { generation: 2 }
    );
    assert_eq!(driver.config().unwrap(), first);
    assert_eq!(driver.fetches(), vec!["http://certs/global.crt".to_string()]);
    assert_eq!(driver.reloads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_same_ssl_id_installed_once_even_from_other_source() {
    let fx = fixture(None);
    let driver = Arc::new(RecordingDriver::ready());
    fx.reconciler.attach_driver(driver.clone());

    let first = entity(
        &fx.store,
        Some(&fx.mappings),
        "first",
        json!({"domain": "shop.example.com", "ssl": {"certificateSourceUrl": "http://certs/one"}}),
    );
    let second = entity(
        &fx.store,
        Some(&fx.mappings),
        "second",
        json!({"domain": "shop.example.com", "path": "/api", "ssl": {"certificateSourceUrl": "http://certs/two"}}),
    );
    fx.store
        .set(&first, &TARGET_ADDRESSES, &addresses(&["10.0.1.1:80"]))
        .unwrap();

    assert!(matches!(
        fx.reconciler.reconcile().await,
        ReconcileOutcome::Applied { .. }
    ));

    // Now only the second mapping has targets, naming a different source for the same id
    fx.store.set(&first, &TARGET_ADDRESSES, &BTreeSet::new()).unwrap();
    fx.store
        .set(&second, &TARGET_ADDRESSES, &addresses(&["10.0.2.1:80"]))
        .unwrap();

    assert!(matches!(
        fx.reconciler.reconcile().await,
        ReconcileOutcome::Applied { .. }
    ));
    assert_eq!(driver.fetches(), vec!["http://certs/one".to_string()]);
    assert_eq!(
        fx.reconciler.installed_ids(),
        ["shop.example.com".to_string()].into_iter().collect()
    );
    let config = driver.config().unwrap();
    assert!(config.contains("10.0.2.1:80"));
    assert!(!config.contains("10.0.1.1:80"));
}

#[tokio::test]
async fn test_invalid_ssl_aborts_before_touching_the_proxy() {
    let fx = fixture(None);
    let driver = Arc::new(RecordingDriver::ready());
    fx.reconciler.attach_driver(driver.clone());

    assert!(matches!(
        fx.reconciler.reconcile().await,
        ReconcileOutcome::Applied { generation: 1 }
    ));
    let before = driver.config().unwrap();

    let broken = entity(
        &fx.store,
        Some(&fx.mappings),
        "broken",
        json!({"domain": "broken.example.com", "ssl": {"reuseSessions": true}}),
    );
    fx.store
        .set(&broken, &TARGET_ADDRESSES, &addresses(&["10.0.9.9:443"]))
        .unwrap();

    let outcome = fx.reconciler.reconcile().await;
    assert!(matches!(
        outcome,
        ReconcileOutcome::Failed { stage: ReconcileStage::Render, .. }
    ));
    assert_eq!(driver.config().unwrap(), before);
    assert_eq!(driver.config_writes.load(Ordering::SeqCst), 1);
    assert_eq!(driver.reloads.load(Ordering::SeqCst), 1);
    assert!(driver.fetches().is_empty());
    assert_eq!(fx.reconciler.generation(), 1);
}

#[tokio::test]
async fn test_not_ready_without_usable_driver() {
    let fx = fixture(None);
    assert!(matches!(
        fx.reconciler.reconcile().await,
        ReconcileOutcome::NotReady { .. }
    ));

    let driver = Arc::new(RecordingDriver::default());
    fx.reconciler.attach_driver(driver.clone());
    assert!(matches!(
        fx.reconciler.reconcile().await,
        ReconcileOutcome::NotReady { .. }
    ));
    assert_eq!(driver.config_writes.load(Ordering::SeqCst), 0);
    assert_eq!(driver.reloads.load(Ordering::SeqCst), 0);

    // The render-only path needs no driver
    let text = fx.reconciler.render().unwrap();
    assert!(text.contains("backend pool"));
    assert!(fx.store.members(&fx.pool).unwrap().len() == 2);
}

#[tokio::test]
async fn test_triggers_during_a_run_collapse_into_one_follow_up() {
    let fx = fixture(None);
    let gate = Arc::new(Semaphore::new(0));
    let driver = Arc::new(RecordingDriver {
        reload_gate: Some(Arc::clone(&gate)),
        ..RecordingDriver::ready()
    });
    fx.reconciler.attach_driver(driver.clone());

    fx.reconciler.trigger();
    eventually("first reload", || driver.reloads.load(Ordering::SeqCst) == 1).await;

    for _ in 0..5 {
        fx.reconciler.trigger();
    }
    gate.add_permits(10);

    eventually("follow-up run", || fx.reconciler.generation() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(driver.reloads.load(Ordering::SeqCst), 2);
    assert_eq!(fx.reconciler.generation(), 2);
}

#[tokio::test]
async fn test_controller_follows_membership_and_health() {
    let mut server = mockito::Server::new_async().await;
    let _health = server
        .mock("GET", "/")
        .with_status(503)
        .expect_at_least(1)
        .create_async()
        .await;

    let mgmt = ManagementContext::new(StewardConfig::default());
    let driver = Arc::new(RecordingDriver::default());
    let drivers: Arc<dyn DriverFactory> = Arc::new(RecordingFactory {
        driver: Arc::clone(&driver),
    });
    let settings = ProxySettings {
        port: 8000,
        poll_period: Duration::from_millis(50),
        template_path: None,
    };
    mgmt.catalog().register("proxy-controller", move || {
        Arc::new(ProxyController::new(settings.clone(), Arc::clone(&drivers)))
    });

    let create = |parent: Option<&str>, entity_type: &str, name: &str, config: Value| {
        let config = match config {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        mgmt.create_entity(NewEntity {
            parent: parent.map(str::to_string),
            entity_type: entity_type.to_string(),
            name: name.to_string(),
            config,
            ..Default::default()
        })
        .unwrap()
    };

    let app = create(None, "application", "shop", json!({}));
    let pool = create(Some(&app), "group", "web", json!({}));
    create(
        Some(&pool),
        "basic",
        "web-1",
        json!({"sensors": {"host.endpoint": "10.0.0.1:8080"}}),
    );
    let mappings = create(Some(&app), "group", "routes", json!({}));
    let api = create(Some(&mappings), "url-mapping", "api", json!({"domain": "api.example.com"}));
    let proxy = create(
        Some(&app),
        "proxy-controller",
        "lb",
        json!({"serverPool": "web", "urlMappings": "routes", "url": format!("{}/", server.url())}),
    );

    mgmt.start_entity(&app).await.unwrap();
    eventually("initial config", || {
        driver
            .config()
            .map(|c| c.contains("10.0.0.1:8080"))
            .unwrap_or(false)
    })
    .await;

    // A new member joins the pool
    let web2 = create(
        Some(&pool),
        "basic",
        "web-2",
        json!({"sensors": {"host.endpoint": "10.0.0.2:8080"}}),
    );
    mgmt.start_entity(&web2).await.unwrap();
    eventually("new pool member", || {
        driver
            .config()
            .map(|c| c.contains("10.0.0.2:8080"))
            .unwrap_or(false)
    })
    .await;

    // Address change on an existing mapping, without a membership change
    let mut params = Params::new();
    params.insert("addresses".to_string(), json!(["10.0.5.1:9000"]));
    let task = mgmt.invoke(&api, "setTargets", params).unwrap();
    assert_eq!(task.wait().await, TaskState::Succeeded { result: json!(1) });
    eventually("mapping targets", || {
        driver
            .config()
            .map(|c| c.contains("acl host_0 hdr(host) -i api.example.com") && c.contains("10.0.5.1:9000"))
            .unwrap_or(false)
    })
    .await;

    // Any HTTP answer counts as up, even a 503
    eventually("proxy running", || {
        mgmt.store().get(&proxy, &SERVICE_STATE) == Some(Lifecycle::Running)
    })
    .await;

    let task = mgmt
        .invoke(&proxy, "getCurrentConfiguration", Params::new())
        .unwrap();
    match task.wait().await {
        TaskState::Succeeded { result } => {
            assert_eq!(result.as_str(), driver.config().as_deref())
        }
        other => panic!("unexpected task state {:?}", other),
    }

    mgmt.stop_entity(&app).await.unwrap();
    assert!(!driver.is_customization_complete());
    let generation = mgmt.store().get(&proxy, &PROXY_CONFIG_GENERATION).unwrap();
    assert_eq!(
        mgmt.reconcile(&proxy).await,
        Some(ReconcileOutcome::NotReady {
            reason: "no driver attached".to_string()
        })
    );
    assert_eq!(
        mgmt.store().get(&proxy, &PROXY_CONFIG_GENERATION),
        Some(generation)
    );
}

/// Renderer that panics on its first call
#[derive(Default)]
struct PanicOnceRenderer {
    calls: AtomicUsize,
}

impl TemplateRenderer for PanicOnceRenderer {
    fn render(&self, template: &str, input: &RenderInput) -> Result<String, RenderError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("renderer blew up");
        }
        BuiltinRenderer.render(template, input)
    }
}

#[tokio::test]
async fn test_triggered_runs_survive_a_panicking_render() {
    let store = store();
    let controller = entity(&store, None, "proxy", json!({}));
    let renderer = Arc::new(PanicOnceRenderer::default());
    let reconciler = Arc::new(Reconciler::new(
        &controller,
        Arc::clone(&store),
        Arc::clone(&renderer) as Arc<dyn TemplateRenderer>,
        ReconcileSettings {
            port: 8000,
            template: DEFAULT_TEMPLATE.to_string(),
            ..Default::default()
        },
    ));
    let driver = Arc::new(RecordingDriver::ready());
    reconciler.attach_driver(driver.clone());

    reconciler.trigger();
    eventually("first render", || renderer.calls.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(driver.config_writes.load(Ordering::SeqCst), 0);

    reconciler.trigger();
    eventually("run after the panic", || reconciler.generation() == 1).await;
    assert_eq!(driver.reloads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_waits_for_the_run_in_flight() {
    let mgmt = ManagementContext::new(StewardConfig::default());
    let gate = Arc::new(Semaphore::new(0));
    let driver = Arc::new(RecordingDriver {
        write_gate: Some(Arc::clone(&gate)),
        ..RecordingDriver::default()
    });
    let drivers: Arc<dyn DriverFactory> = Arc::new(RecordingFactory {
        driver: Arc::clone(&driver),
    });
    let settings = ProxySettings {
        port: 8000,
        poll_period: Duration::from_millis(50),
        template_path: None,
    };
    mgmt.catalog().register("proxy-controller", move || {
        Arc::new(ProxyController::new(settings.clone(), Arc::clone(&drivers)))
    });

    let proxy = mgmt
        .create_entity(NewEntity {
            entity_type: "proxy-controller".to_string(),
            name: "lb".to_string(),
            config: [("url".to_string(), json!("http://127.0.0.1:1/"))]
                .into_iter()
                .collect(),
            ..Default::default()
        })
        .unwrap();
    mgmt.start_entity(&proxy).await.unwrap();
    eventually("config write in progress", || {
        driver.write_attempts.load(Ordering::SeqCst) == 1
    })
    .await;

    let stopping = {
        let mgmt = Arc::clone(&mgmt);
        let proxy = proxy.clone();
        tokio::spawn(async move { mgmt.stop_entity(&proxy).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopping.is_finished());

    gate.add_permits(10);
    stopping.await.unwrap().unwrap();
    let writes = driver.config_writes.load(Ordering::SeqCst);
    let reloads = driver.reloads.load(Ordering::SeqCst);
    let outcome = mgmt.store().get_attribute(&proxy, "proxy.reconcile.lastOutcome");
    assert_eq!((writes, reloads), (1, 1));
    assert!(!driver.is_customization_complete());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(driver.config_writes.load(Ordering::SeqCst), writes);
    assert_eq!(driver.reloads.load(Ordering::SeqCst), reloads);
    assert_eq!(
        mgmt.store().get_attribute(&proxy, "proxy.reconcile.lastOutcome"),
        outcome
    );
}
