// Effector schemas, task state machine and executor

mod executor;
mod schema;
mod task;

pub use executor::TaskExecutor;
pub use schema::{EffectorSpec, ParameterSpec, ParameterType, Params};
pub use task::{TaskContext, TaskHandle, TaskId, TaskState, TaskSummary};

use crate::state::EntityId;
use thiserror::Error;

/// Effector invocation errors; all are raised before any task is started
#[derive(Debug, Error, PartialEq)]
pub enum EffectorError {
    #[error("entity '{0}' not found")]
    EntityNotFound(EntityId),

    #[error("entity '{entity}' has no effector '{effector}'")]
    UnknownEffector { entity: EntityId, effector: String },

    #[error("effector '{effector}' requires parameter '{parameter}'")]
    MissingParameter { effector: String, parameter: String },

    #[error("effector '{effector}' parameter '{parameter}' must be {expected}, got {found}")]
    InvalidParameter {
        effector: String,
        parameter: String,
        expected: ParameterType,
        found: String,
    },

    #[error("effector '{effector}' does not accept parameter '{parameter}'")]
    UnexpectedParameter { effector: String, parameter: String },

    #[error("management context is shutting down")]
    ManagementStopped,
}
