use crate::effector::task::{TaskContext, TaskHandle, TaskId, TaskSummary};
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Runs effector bodies as tracked tasks on the tokio runtime.
///
/// At most `max_concurrent` task bodies run at once; the rest wait PENDING for a permit.
/// Finished tasks are retained so late observers can still read their terminal state,
/// up to `retain_finished` of them; the oldest are dropped first.
pub struct TaskExecutor {
    tasks: DashMap<TaskId, TaskHandle>,
    permits: Arc<Semaphore>,
    retain_finished: usize,
}

const DEFAULT_RETAIN_FINISHED: usize = 1024;

impl TaskExecutor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tasks: DashMap::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retain_finished: DEFAULT_RETAIN_FINISHED,
        }
    }

    pub fn retain_finished(mut self, limit: usize) -> Self {
        self.retain_finished = limit;
        self
    }

    /// Schedule `body` and return its handle immediately.
    pub fn submit<F, Fut>(&self, entity_id: &str, effector: &str, body: F) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.prune_finished();
        let handle = TaskHandle::new(entity_id, effector);
        self.tasks.insert(handle.id().to_string(), handle.clone());

        let task = handle.clone();
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    task.finish(Err("task executor closed".to_string()));
                    return;
                }
            };

            if !task.mark_running() {
                debug!(task_id = %task.id(), "Task cancelled before it started");
                return;
            }

            let outcome = AssertUnwindSafe(body(task.context())).catch_unwind().await;
            match outcome {
                Ok(Ok(result)) => {
                    info!(
                        task_id = %task.id(),
                        entity_id = %task.entity_id(),
                        effector = %task.effector(),
                        "Task succeeded"
                    );
                    task.finish(Ok(result));
                }
                Ok(Err(e)) => {
                    warn!(
                        task_id = %task.id(),
                        entity_id = %task.entity_id(),
                        effector = %task.effector(),
                        error = %e,
                        "Task failed"
                    );
                    task.finish(Err(format!("{:#}", e)));
                }
                Err(_) => {
                    warn!(task_id = %task.id(), effector = %task.effector(), "Task panicked");
                    task.finish(Err("effector panicked".to_string()));
                }
            }
        });

        handle
    }

    pub fn get(&self, task_id: &str) -> Option<TaskHandle> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    /// Summaries of every retained task, oldest first
    pub fn list(&self) -> Vec<TaskSummary> {
        let mut tasks: Vec<TaskSummary> = self.tasks.iter().map(|t| t.summary()).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Summaries of all tasks for one entity, oldest first
    pub fn tasks_for(&self, entity_id: &str) -> Vec<TaskSummary> {
        let mut tasks: Vec<TaskSummary> = self
            .tasks
            .iter()
            .filter(|t| t.entity_id() == entity_id)
            .map(|t| t.summary())
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Drop finished tasks of removed entities
    pub fn forget_entity(&self, entity_id: &str) {
        self.tasks
            .retain(|_, t| t.entity_id() != entity_id || !t.state().is_terminal());
    }

    fn prune_finished(&self) {
        let mut finished: Vec<TaskSummary> = self
            .tasks
            .iter()
            .filter(|t| t.state().is_terminal())
            .map(|t| t.summary())
            .collect();
        if finished.len() <= self.retain_finished {
            return;
        }
        finished.sort_by(|a, b| (a.submitted_at, &a.id).cmp(&(b.submitted_at, &b.id)));
        let excess = finished.len() - self.retain_finished;
        for task in &finished[..excess] {
            self.tasks.remove(&task.id);
        }
        debug!(dropped = excess, "Pruned finished tasks");
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
