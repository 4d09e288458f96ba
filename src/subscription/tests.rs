use super::*;
use crate::state::{EntityStore, NewEntity};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn store_with(ids: &[&str]) -> EntityStore {
    let store = EntityStore::new(Arc::new(SubscriptionRegistry::new()));
    for id in ids {
        store
            .create_entity(NewEntity {
                id: Some(id.to_string()),
                ..Default::default()
            })
            .unwrap();
    }
    store
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let registry = SubscriptionRegistry::new();
    let handle = registry.subscribe(
        "policy-1",
        EntitySelector::Entity("e".to_string()),
        SensorFilter::Any,
        |_| Ok(()),
    );

    assert_eq!(registry.len(), 1);
    assert!(registry.unsubscribe(handle));
    assert!(!registry.unsubscribe(handle));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_unsubscribe_all_only_touches_owner() {
    let registry = SubscriptionRegistry::new();
    for _ in 0..3 {
        registry.subscribe("a", EntitySelector::Entity("e".into()), SensorFilter::Any, |_| Ok(()));
    }
    registry.subscribe("b", EntitySelector::Entity("e".into()), SensorFilter::Any, |_| Ok(()));

    assert_eq!(registry.unsubscribe_all("a"), 3);
    assert_eq!(registry.subscription_count("a"), 0);
    assert_eq!(registry.subscription_count("b"), 1);
}

#[tokio::test]
async fn test_failing_subscriber_does_not_block_others() {
    let store = store_with(&["e"]);

    store.bus().subscribe(
        "broken",
        EntitySelector::Entity("e".into()),
        SensorFilter::Any,
        |_| anyhow::bail!("always fails"),
    );
    store.bus().subscribe(
        "panicky",
        EntitySelector::Entity("e".into()),
        SensorFilter::Any,
        |_| panic!("boom"),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    store.bus().subscribe(
        "healthy",
        EntitySelector::Entity("e".into()),
        SensorFilter::Any,
        move |event| {
            tx.send(event.new_value.clone())?;
            Ok(())
        },
    );

    // Writer never sees subscriber failures
    store.set_attribute("e", "x", json!(1)).unwrap();
    store.set_attribute("e", "x", json!(2)).unwrap();

    for expected in [json!(1), json!(2)] {
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, expected);
    }
}

#[tokio::test]
async fn test_no_delivery_after_unsubscribe_settles() {
    let store = store_with(&["e"]);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = store.bus().subscribe(
        "test",
        EntitySelector::Entity("e".into()),
        SensorFilter::Any,
        move |event| {
            tx.send(event.new_value.clone())?;
            Ok(())
        },
    );

    store.set_attribute("e", "x", json!(1)).unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(first, Some(json!(1)));

    store.bus().unsubscribe(handle);
    store.set_attribute("e", "x", json!(2)).unwrap();
    store.set_attribute("e", "x", json!(3)).unwrap();

    // The delivery task exits and drops the sender
    let rest = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(rest, None);
}

#[test]
fn test_selector_matching() {
    let lineage = vec!["leaf".to_string(), "group".to_string(), "app".to_string()];

    assert!(EntitySelector::Entity("leaf".into()).matches(&lineage));
    assert!(!EntitySelector::Entity("group".into()).matches(&lineage));
    assert!(EntitySelector::Descendants("group".into()).matches(&lineage));
    assert!(EntitySelector::Descendants("leaf".into()).matches(&lineage));
    assert!(!EntitySelector::Descendants("other".into()).matches(&lineage));
}
