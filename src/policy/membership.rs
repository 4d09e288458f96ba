use crate::policy::{Policy, PolicyContext};
use crate::state::sensor::GROUP_MEMBERS;
use crate::state::{EntityId, SensorEvent};
use crate::subscription::{EntitySelector, SensorFilter};
use anyhow::Context;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Change to a tracked group
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MembershipEvent {
    Added(EntityId),
    Removed(EntityId),
    /// A current member's tracked sensor changed
    Changed(EntityId),
}

type Listener = Arc<dyn Fn(MembershipEvent) + Send + Sync>;

#[derive(Default)]
struct Snapshot {
    members: BTreeSet<EntityId>,
    /// Group write sequence the member set was read at
    sequence: u64,
}

/// Watches a group's member set and reports additions and removals.
///
/// On attach, every current member is reported as `Added`. After that each
/// `group.members` change is diffed against the last snapshot, so repeating
/// the same member set reports nothing. With [`track_sensor`](Self::track_sensor),
/// changes to that sensor on a current member are reported as `Changed`.
pub struct MembershipTracker {
    group: EntityId,
    tracked_sensor: Option<String>,
    listener: Listener,
    snapshot: Mutex<Option<Snapshot>>,
}

impl MembershipTracker {
    pub fn new<F>(group: &str, listener: F) -> Self
    where
        F: Fn(MembershipEvent) + Send + Sync + 'static,
    {
        Self {
            group: group.to_string(),
            tracked_sensor: None,
            listener: Arc::new(listener),
            snapshot: Mutex::new(None),
        }
    }

    pub fn track_sensor(mut self, sensor: &str) -> Self {
        self.tracked_sensor = Some(sensor.to_string());
        self
    }

    /// Members as of the last processed change
    pub fn members(&self) -> BTreeSet<EntityId> {
        self.lock()
            .as_ref()
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Snapshot>> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_members_changed(&self, event: &SensorEvent) -> anyhow::Result<()> {
        let mut guard = self.lock();
        // Not initialised yet, or already covered by the initial snapshot
        let Some(snapshot) = guard.as_mut() else {
            return Ok(());
        };
        if event.sequence <= snapshot.sequence {
            return Ok(());
        }

        let current: BTreeSet<EntityId> = event
            .value()
            .context("group.members is not a set of entity ids")?;

        for removed in snapshot.members.difference(&current) {
            (self.listener)(MembershipEvent::Removed(removed.clone()));
        }
        for added in current.difference(&snapshot.members) {
            (self.listener)(MembershipEvent::Added(added.clone()));
        }

        snapshot.members = current;
        snapshot.sequence = event.sequence;
        Ok(())
    }

    fn on_member_sensor(&self, event: &SensorEvent) {
        let guard = self.lock();
        let is_member = guard
            .as_ref()
            .map(|s| s.members.contains(&event.source))
            .unwrap_or(false);
        if is_member {
            (self.listener)(MembershipEvent::Changed(event.source.clone()));
        }
    }
}

impl Policy for MembershipTracker {
    fn name(&self) -> &str {
        "membership-tracker"
    }

    fn attach(self: Arc<Self>, ctx: &PolicyContext) -> anyhow::Result<()> {
        // Subscribe before snapshotting so no change can fall between the two
        let tracker = Arc::clone(&self);
        ctx.subscribe(
            EntitySelector::Entity(self.group.clone()),
            SensorFilter::sensor(GROUP_MEMBERS.name()),
            move |event| tracker.on_members_changed(event),
        );

        if let Some(sensor) = &self.tracked_sensor {
            let tracker = Arc::clone(&self);
            ctx.subscribe(
                EntitySelector::Descendants(self.group.clone()),
                SensorFilter::sensor(sensor.clone()),
                move |event| {
                    tracker.on_member_sensor(event);
                    Ok(())
                },
            );
        }

        let mut guard = self.lock();
        let (value, sequence) = ctx
            .store()
            .get_attribute_versioned(&self.group, GROUP_MEMBERS.name())
            .with_context(|| format!("group '{}' not found", self.group))?;
        let members: BTreeSet<EntityId> = match value {
            Some(v) => serde_json::from_value(v).context("group.members is not a set")?,
            None => BTreeSet::new(),
        };

        debug!(group = %self.group, members = members.len(), "Membership snapshot taken");
        for member in &members {
            (self.listener)(MembershipEvent::Added(member.clone()));
        }
        *guard = Some(Snapshot { members, sequence });
        Ok(())
    }

    fn on_detach(&self, _ctx: &PolicyContext) {
        *self.lock() = None;
    }
}
