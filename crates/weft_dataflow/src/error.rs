//! Error taxonomy of the dataflow kernel.
//!
//! Every task future resolves to either a value or one of these errors.
//! `TimedOut` is the exception: it is returned to a waiter whose deadline
//! passed and is never stored in a future.

use crate::executor::{ExecFailure, ExecutorError};
use std::time::Duration;
use weft_core::{CoreError, TaskId};

/// Kernel error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataflowError {
    /// A future was resolved twice, or a task made an illegal state change.
    /// Fatal to the run.
    #[error("Protocol violation on {task_id}: {reason}")]
    ProtocolViolation {
        /// Task whose invariant broke
        task_id: TaskId,
        /// What happened
        reason: String,
    },

    /// A dependency failed or was cancelled, so the task never ran
    #[error("{task_id} skipped: dependency {dependency} did not succeed ({cause})")]
    UpstreamFailure {
        /// Task that was short-circuited
        task_id: TaskId,
        /// The dependency that did not succeed
        dependency: TaskId,
        /// Outcome of that dependency
        cause: Box<DataflowError>,
    },

    /// The backend reported the task itself failed and no retries remain
    #[error("{task_id} failed after {attempts} attempt(s): {failure}")]
    ExecutionFailure {
        /// Failed task
        task_id: TaskId,
        /// Number of executor submissions
        attempts: u32,
        /// Last reported failure
        failure: ExecFailure,
    },

    /// A waiter's deadline elapsed before the future resolved
    #[error("Timed out after {waited:?} waiting for {task_id}")]
    TimedOut {
        /// Task being waited on
        task_id: TaskId,
        /// How long the caller waited
        waited: Duration,
    },

    /// The task was cancelled explicitly or by kernel shutdown
    #[error("{task_id} was cancelled")]
    Cancelled {
        /// Cancelled task
        task_id: TaskId,
    },

    /// The task named an executor label that is not registered
    #[error("{task_id} routed to unknown executor '{label}'")]
    UnknownExecutor {
        /// Task that could not be routed
        task_id: TaskId,
        /// Requested label
        label: String,
    },

    /// Invalid kernel configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Checkpoint store failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Executor lifecycle failure
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Kernel machinery failed, e.g. a scheduler thread could not start
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DataflowError {
    /// Task this error is about, if any
    #[must_use]
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::ProtocolViolation { task_id, .. }
            | Self::UpstreamFailure { task_id, .. }
            | Self::ExecutionFailure { task_id, .. }
            | Self::TimedOut { task_id, .. }
            | Self::Cancelled { task_id }
            | Self::UnknownExecutor { task_id, .. } => Some(*task_id),
            Self::Configuration(_)
            | Self::Checkpoint(_)
            | Self::Executor(_)
            | Self::Internal(_) => None,
        }
    }

    /// Follow `UpstreamFailure` links to the error that started the chain
    #[must_use]
    pub fn root_cause(&self) -> &DataflowError {
        let mut current = self;
        while let Self::UpstreamFailure { cause, .. } = current {
            current = cause;
        }
        current
    }

    /// Whether this is an upstream short-circuit
    #[must_use]
    pub const fn is_upstream_failure(&self) -> bool {
        matches!(self, Self::UpstreamFailure { .. })
    }

    /// Whether this is a cancellation
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether this is a waiter timeout
    #[must_use]
    pub const fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

impl From<CoreError> for DataflowError {
    fn from(err: CoreError) -> Self {
        Self::Checkpoint(err.to_string())
    }
}
