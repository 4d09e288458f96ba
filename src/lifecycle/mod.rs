//! Lifecycle states and the logic deriving them from health indicators.

mod aggregate;
mod service_state;

pub use aggregate::ChildStateAggregator;
pub use service_state::{ServiceStateLogic, NOT_UP_INDICATOR_PREFIX_CHILD};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Starting,
    Running,
    OnFire,
    Stopping,
    Stopped,
}

impl Lifecycle {
    /// Actual state implied by the expected state and current health.
    ///
    /// While the entity is expected to be running, it is RUNNING iff it has no not-up
    /// indicators. An unhealthy entity only reports ON_FIRE once it has been RUNNING (or is
    /// already ON_FIRE); before that it is still STARTING. Every other expected state is
    /// reported as-is.
    pub fn derive(expected: Lifecycle, current: Option<Lifecycle>, healthy: bool) -> Lifecycle {
        match expected {
            Lifecycle::Running if healthy => Lifecycle::Running,
            Lifecycle::Running => match current {
                Some(Lifecycle::Running) | Some(Lifecycle::OnFire) => Lifecycle::OnFire,
                _ => Lifecycle::Starting,
            },
            other => other,
        }
    }

    /// Whether `self -> next` is a legal transition of the state machine.
    pub fn can_transition_to(self, next: Lifecycle) -> bool {
        use Lifecycle::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Created, Starting)
                | (Created, Stopping)
                | (Starting, Running)
                | (Starting, OnFire)
                | (Starting, Stopping)
                | (Running, OnFire)
                | (Running, Stopping)
                | (OnFire, Running)
                | (OnFire, Stopping)
                | (Stopping, Stopped)
                | (Stopping, OnFire)
                | (Stopped, Starting)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::OnFire => "on_fire",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
