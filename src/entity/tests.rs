use super::*;
use crate::config::StewardConfig;
use crate::effector::TaskState;
use crate::lifecycle::{Lifecycle, ServiceStateLogic};
use crate::state::sensor::SERVICE_NOT_UP_INDICATORS;
use crate::state::NewEntity;
use serde_json::json;
use std::time::Duration;

fn create(
    mgmt: &ManagementContext,
    parent: Option<&str>,
    entity_type: &str,
    name: &str,
    config: Value,
) -> EntityId {
    let config = match config {
        Value::Object(map) => map.into_iter().collect(),
        _ => Default::default(),
    };
    mgmt.create_entity(NewEntity {
        parent: parent.map(str::to_string),
        entity_type: entity_type.to_string(),
        name: name.to_string(),
        config,
        ..Default::default()
    })
    .unwrap()
}

async fn wait_for(store: &EntityStore, id: &str, expected: Lifecycle) {
    for _ in 0..200 {
        if ServiceStateLogic::state(store, id) == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached {}", id, expected);
}

#[test]
fn test_catalog_falls_back_to_basic_entity() {
    let catalog = EntityCatalog::new();
    assert!(catalog.contains("group"));
    assert!(!catalog.contains("database"));

    let behavior = catalog.create("database");
    assert_eq!(behavior.type_name(), "database");
    assert_eq!(behavior.effectors()[0].name, "setSensor");
    assert!(behavior.reconcilable().is_none());
}

#[test]
fn test_catalog_register_replaces() {
    let catalog = EntityCatalog::new();
    catalog.register("group", || Arc::new(BasicEntity::new("flat")));
    assert_eq!(catalog.create("group").type_name(), "flat");
    assert_eq!(
        catalog.types(),
        vec!["application".to_string(), "basic".to_string(), "group".to_string()]
    );
}

#[tokio::test]
async fn test_basic_entity_publishes_configured_sensors() {
    let mgmt = ManagementContext::new(StewardConfig::default());
    let id = create(
        &mgmt,
        None,
        "basic",
        "web",
        json!({"sensors": {"http.port": 8080, "host.name": "web-1"}}),
    );
    assert_eq!(mgmt.store().get_attribute(&id, "http.port"), None);

    mgmt.start_entity(&id).await.unwrap();
    assert_eq!(mgmt.store().get_attribute(&id, "http.port"), Some(json!(8080)));
    assert_eq!(
        mgmt.store().get_attribute(&id, "host.name"),
        Some(json!("web-1"))
    );
    assert_eq!(ServiceStateLogic::state(mgmt.store(), &id), Some(Lifecycle::Running));

    let mut params = Params::new();
    params.insert("name".to_string(), json!("http.port"));
    params.insert("value".to_string(), json!(9090));
    let task = mgmt.invoke(&id, "setSensor", params).unwrap();
    assert_eq!(task.wait().await, TaskState::Succeeded { result: Value::Null });
    assert_eq!(mgmt.store().get_attribute(&id, "http.port"), Some(json!(9090)));
}

#[tokio::test]
async fn test_context_reads_config_and_sensors() {
    let mgmt = ManagementContext::new(StewardConfig::default());
    let id = create(&mgmt, None, "basic", "db", json!({"port": 5432}));
    let ctx = EntityContext::new(&id, Arc::clone(&mgmt));

    assert_eq!(ctx.config::<u16>("port"), Some(5432));
    assert_eq!(ctx.config::<String>("port"), None);
    assert_eq!(ctx.entity().unwrap().name, "db");

    const ROLE: Sensor<String> = Sensor::new("db.role", "Replication role");
    ctx.set(&ROLE, &"primary".to_string()).unwrap();
    assert_eq!(ctx.get(&ROLE).as_deref(), Some("primary"));
}

#[tokio::test]
async fn test_group_follows_children() {
    let mgmt = ManagementContext::new(StewardConfig::default());
    let app = create(&mgmt, None, "application", "shop", json!({}));
    let web = create(&mgmt, Some(&app), "basic", "web", json!({}));
    create(&mgmt, Some(&app), "basic", "db", json!({}));

    mgmt.start_entity(&app).await.unwrap();
    wait_for(mgmt.store(), &app, Lifecycle::Running).await;

    ServiceStateLogic::update_not_up_indicator(mgmt.store(), &web, "disk", Some("disk full"))
        .unwrap();
    wait_for(mgmt.store(), &app, Lifecycle::OnFire).await;
    let indicators = mgmt.store().get(&app, &SERVICE_NOT_UP_INDICATORS).unwrap();
    assert_eq!(indicators.len(), 1);
    assert_eq!(
        indicators.get(&format!("child:{}", web)).map(String::as_str),
        Some("web is on_fire")
    );
}
