use crate::feed::FeedSource;
use crate::state::{EntityId, EntityStore, StoreError};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

struct RunningFeed {
    /// Cleared by `stop`; checked under the lock before every publish
    live: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

impl RunningFeed {
    fn halt(self) {
        // Taking the lock waits out a publish that is already in progress
        *self.live.lock().unwrap_or_else(|e| e.into_inner()) = false;
        self.task.abort();
    }
}

/// Owns every feed in the management context, keyed by (entity, tag).
pub struct FeedRunner {
    store: Arc<EntityStore>,
    feeds: DashMap<(EntityId, String), RunningFeed>,
    poll_timeout: Duration,
}

impl FeedRunner {
    pub fn new(store: Arc<EntityStore>, poll_timeout: Duration) -> Self {
        Self {
            store,
            feeds: DashMap::new(),
            poll_timeout,
        }
    }

    /// Start polling `source` every `period`, publishing to `sensor` on `entity_id`.
    ///
    /// A feed already running under the same (entity, tag) is stopped and replaced.
    pub fn start(
        &self,
        entity_id: &str,
        tag: &str,
        sensor: &str,
        period: Duration,
        source: Arc<dyn FeedSource>,
    ) {
        let live = Arc::new(Mutex::new(true));
        let task = tokio::spawn(run_feed(
            Arc::clone(&self.store),
            entity_id.to_string(),
            tag.to_string(),
            sensor.to_string(),
            period,
            self.poll_timeout,
            source,
            Arc::clone(&live),
        ));

        let key = (entity_id.to_string(), tag.to_string());
        if let Some(old) = self.feeds.insert(key, RunningFeed { live, task }) {
            debug!(entity_id = %entity_id, tag = %tag, "Replacing running feed");
            old.halt();
        }

        info!(
            entity_id = %entity_id,
            tag = %tag,
            sensor = %sensor,
            period_ms = period.as_millis() as u64,
            "Feed started"
        );
    }

    /// Stop one feed. Once this returns the feed publishes nothing further.
    pub fn stop(&self, entity_id: &str, tag: &str) -> bool {
        match self.feeds.remove(&(entity_id.to_string(), tag.to_string())) {
            Some((_, feed)) => {
                feed.halt();
                info!(entity_id = %entity_id, tag = %tag, "Feed stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every feed owned by `entity_id`; returns how many were stopped.
    pub fn stop_all(&self, entity_id: &str) -> usize {
        let tags: Vec<String> = self
            .feeds
            .iter()
            .filter(|f| f.key().0 == entity_id)
            .map(|f| f.key().1.clone())
            .collect();

        tags.iter().filter(|tag| self.stop(entity_id, tag)).count()
    }

    pub fn is_running(&self, entity_id: &str, tag: &str) -> bool {
        self.feeds
            .contains_key(&(entity_id.to_string(), tag.to_string()))
    }

    /// Number of feeds currently scheduled
    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_feed(
    store: Arc<EntityStore>,
    entity_id: EntityId,
    tag: String,
    sensor: String,
    period: Duration,
    poll_timeout: Duration,
    source: Arc<dyn FeedSource>,
    live: Arc<Mutex<bool>>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let value = match tokio::time::timeout(poll_timeout, source.poll()).await {
            Ok(value) => value,
            Err(_) => {
                warn!(entity_id = %entity_id, tag = %tag, "Feed poll timed out");
                source.fallback()
            }
        };

        let publishing = live.lock().unwrap_or_else(|e| e.into_inner());
        if !*publishing {
            break;
        }
        match store.set_attribute(&entity_id, &sensor, value) {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                debug!(entity_id = %entity_id, tag = %tag, "Feed entity gone, stopping");
                break;
            }
            Err(e) => {
                warn!(entity_id = %entity_id, tag = %tag, error = %e, "Feed publish failed");
            }
        }
    }
}
