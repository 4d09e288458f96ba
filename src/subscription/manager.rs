use crate::state::{EntityId, SensorEvent};
use crate::subscription::protocol::{EntitySelector, SensorFilter, SubscriptionHandle};
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Subscriber callback. Runs on the subscription's own delivery task.
pub type Callback = Arc<dyn Fn(&SensorEvent) -> anyhow::Result<()> + Send + Sync>;

struct SubscriptionEntry {
    subscriber: String,
    selector: EntitySelector,
    filter: SensorFilter,
    tx: mpsc::UnboundedSender<SensorEvent>,
    active: Arc<AtomicBool>,
}

/// Routes sensor events to registered subscribers.
///
/// Every subscription owns an unbounded FIFO queue drained by a dedicated tokio task,
/// so callbacks for one subscription never overlap while different subscriptions
/// are delivered concurrently. Publishing only enqueues; it never runs callbacks
/// on the writer's stack.
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    entries: DashMap<u64, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    /// Register a callback for events matching `selector` and `filter`.
    ///
    /// Must be called from within a tokio runtime (spawns the delivery task).
    pub fn subscribe<F>(
        &self,
        subscriber: impl Into<String>,
        selector: EntitySelector,
        filter: SensorFilter,
        callback: F,
    ) -> SubscriptionHandle
    where
        F: Fn(&SensorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = SubscriptionHandle(id);
        let subscriber = subscriber.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        debug!(
            subscription = %handle,
            subscriber = %subscriber,
            selector = ?selector,
            filter = ?filter,
            "Subscription registered"
        );

        tokio::spawn(run_delivery(
            handle,
            subscriber.clone(),
            rx,
            Arc::clone(&active),
            Arc::new(callback),
        ));

        self.entries.insert(
            id,
            SubscriptionEntry {
                subscriber,
                selector,
                filter,
                tx,
                active,
            },
        );

        handle
    }

    /// Remove a subscription. Idempotent; returns whether it was still registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        match self.entries.remove(&handle.0) {
            Some((_, entry)) => {
                entry.active.store(false, Ordering::SeqCst);
                debug!(subscription = %handle, subscriber = %entry.subscriber, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Remove every subscription owned by `subscriber`. Returns how many were removed.
    pub fn unsubscribe_all(&self, subscriber: &str) -> usize {
        let handles: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.value().subscriber == subscriber)
            .map(|e| *e.key())
            .collect();

        handles
            .into_iter()
            .filter(|id| self.unsubscribe(SubscriptionHandle(*id)))
            .count()
    }

    /// Number of live subscriptions owned by `subscriber`
    pub fn subscription_count(&self, subscriber: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().subscriber == subscriber)
            .count()
    }

    /// Total number of live subscriptions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enqueue `event` for every matching subscription.
    ///
    /// `lineage` is the source entity followed by its ancestors. The store calls this while
    /// holding the source entity's write lock, which keeps per-(entity, sensor) order
    /// identical across all subscribers.
    pub(crate) fn publish(&self, event: &SensorEvent, lineage: &[EntityId]) {
        for entry in self.entries.iter() {
            let sub = entry.value();
            if !sub.filter.matches(event) || !sub.selector.matches(lineage) {
                continue;
            }
            // Closed queue means the subscription is being torn down
            let _ = sub.tx.send(event.clone());
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_delivery(
    handle: SubscriptionHandle,
    subscriber: String,
    mut rx: mpsc::UnboundedReceiver<SensorEvent>,
    active: Arc<AtomicBool>,
    callback: Callback,
) {
    while let Some(event) = rx.recv().await {
        if !active.load(Ordering::SeqCst) {
            break;
        }

        match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    subscription = %handle,
                    subscriber = %subscriber,
                    entity_id = %event.source,
                    sensor = %event.sensor,
                    error = %e,
                    "Subscriber callback failed"
                );
            }
            Err(_) => {
                error!(
                    subscription = %handle,
                    subscriber = %subscriber,
                    entity_id = %event.source,
                    sensor = %event.sensor,
                    "Subscriber callback panicked"
                );
            }
        }
    }

    debug!(subscription = %handle, "Delivery task finished");
}
