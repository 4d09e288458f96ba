use crate::state::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub type TaskId = String;

/// Task state machine: PENDING -> RUNNING -> {SUCCEEDED | FAILED | CANCELLED}.
///
/// Terminal states are final; every observer sees the same terminal value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded { result: Value },
    Failed { error: String },
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded { .. } | TaskState::Failed { .. } | TaskState::Cancelled
        )
    }
}

struct TaskInner {
    id: TaskId,
    entity_id: EntityId,
    effector: String,
    submitted_at: DateTime<Utc>,
    state: watch::Sender<TaskState>,
    cancel_requested: AtomicBool,
}

/// Shared handle to one effector invocation
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

/// Serializable view of a task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    #[serde(rename = "entityId")]
    pub entity_id: EntityId,
    pub effector: String,
    #[serde(rename = "submittedAt")]
    pub submitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: TaskState,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("entity_id", &self.inner.entity_id)
            .field("effector", &self.inner.effector)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskHandle {
    pub(crate) fn new(entity_id: &str, effector: &str) -> Self {
        let (state, _) = watch::channel(TaskState::Pending);
        Self {
            inner: Arc::new(TaskInner {
                id: uuid::Uuid::now_v7().to_string(),
                entity_id: entity_id.to_string(),
                effector: effector.to_string(),
                submitted_at: Utc::now(),
                state,
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn entity_id(&self) -> &str {
        &self.inner.entity_id
    }

    pub fn effector(&self) -> &str {
        &self.inner.effector
    }

    pub fn state(&self) -> TaskState {
        self.inner.state.borrow().clone()
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.inner.id.clone(),
            entity_id: self.inner.entity_id.clone(),
            effector: self.inner.effector.clone(),
            submitted_at: self.inner.submitted_at,
            state: self.state(),
        }
    }

    /// Request cancellation.
    ///
    /// A PENDING task becomes CANCELLED immediately and `true` is returned. A RUNNING task
    /// only gets the cooperative flag set, observable through [`TaskContext::is_cancelled`].
    pub fn cancel(&self) -> bool {
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
        self.inner.state.send_if_modified(|state| {
            if *state == TaskState::Pending {
                *state = TaskState::Cancelled;
                true
            } else {
                false
            }
        })
    }

    /// Wait for a terminal state
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.inner.state.subscribe();
        let terminal = match rx.wait_for(TaskState::is_terminal).await {
            Ok(state) => state.clone(),
            // Sender lives as long as the handle; unreachable in practice
            Err(_) => self.state(),
        };
        terminal
    }

    /// PENDING -> RUNNING; false if the task was cancelled first
    pub(crate) fn mark_running(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == TaskState::Pending {
                *state = TaskState::Running;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn finish(&self, outcome: Result<Value, String>) {
        self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = match outcome {
                Ok(result) => TaskState::Succeeded { result },
                Err(error) => TaskState::Failed { error },
            };
            true
        });
    }

    pub(crate) fn context(&self) -> TaskContext {
        TaskContext {
            task: self.clone(),
        }
    }
}

/// Handed to a running effector body
#[derive(Clone)]
pub struct TaskContext {
    task: TaskHandle,
}

impl TaskContext {
    pub fn task_id(&self) -> &str {
        self.task.id()
    }

    /// Cooperative cancellation check
    pub fn is_cancelled(&self) -> bool {
        self.task.inner.cancel_requested.load(Ordering::SeqCst)
    }
}
