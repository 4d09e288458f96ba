use crate::lifecycle::Lifecycle;
use crate::policy::{Policy, PolicyContext};
use crate::state::sensor::SERVICE_STATE;
use crate::subscription::{EntitySelector, SensorFilter};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Body posted to the web hook
#[derive(Debug, Serialize)]
struct Notification<'a> {
    #[serde(rename = "entityId")]
    entity_id: &'a str,
    #[serde(rename = "entityName", skip_serializing_if = "Option::is_none")]
    entity_name: Option<String>,
    state: Lifecycle,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Calls a web hook whenever its entity goes ON_FIRE.
///
/// Requests are sent from a spawned task; a slow or failing hook never
/// delays event delivery.
pub struct HttpNotifierPolicy {
    webhook_url: String,
    client: reqwest::Client,
    sent: Arc<AtomicU64>,
}

impl HttpNotifierPolicy {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: reqwest::Client::new(),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Notifications the hook accepted with a 2xx
    pub fn notifications_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

impl Policy for HttpNotifierPolicy {
    fn name(&self) -> &str {
        "http-notifier"
    }

    fn attach(self: Arc<Self>, ctx: &PolicyContext) -> anyhow::Result<()> {
        let store = Arc::clone(ctx.store());
        let policy = Arc::clone(&self);
        ctx.subscribe(
            EntitySelector::Entity(ctx.entity_id().to_string()),
            SensorFilter::sensor(SERVICE_STATE.name()),
            move |event| {
                if event.value::<Lifecycle>() != Some(Lifecycle::OnFire) {
                    return Ok(());
                }

                let body = serde_json::to_value(Notification {
                    entity_id: &event.source,
                    entity_name: store.get_entity(&event.source).map(|e| e.name),
                    state: Lifecycle::OnFire,
                    timestamp: event.timestamp,
                })?;
                let request = policy.client.post(&policy.webhook_url).json(&body);
                let sent = Arc::clone(&policy.sent);
                let entity_id = event.source.clone();

                tokio::spawn(async move {
                    match request.send().await {
                        Ok(response) if response.status().is_success() => {
                            sent.fetch_add(1, Ordering::SeqCst);
                            info!(entity_id = %entity_id, "On-fire notification sent");
                        }
                        Ok(response) => {
                            warn!(
                                entity_id = %entity_id,
                                status = %response.status(),
                                "Web hook rejected notification"
                            );
                        }
                        Err(e) => {
                            warn!(entity_id = %entity_id, error = %e, "Web hook unreachable");
                        }
                    }
                });
                Ok(())
            },
        );
        Ok(())
    }
}
