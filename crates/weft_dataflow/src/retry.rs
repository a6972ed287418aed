//! Bounded retries.
//!
//! A task with a retry bound of `N` is handed to an executor at most `N + 1`
//! times. Retries reuse the task's record and future, so dependents never
//! see an intermediate failure.

use crate::error::DataflowError;
use crate::executor::ExecFailure;
use crate::task::{TaskState, TaskStatus};
use weft_core::TaskId;

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again; `retry` counts retries including this one
    Retry {
        /// Retry number, starting at 1
        retry: u32,
    },
    /// Resolve the future with the failure
    GiveUp {
        /// Retries consumed
        retries: u32,
    },
}

/// Retry bound check
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    /// Decide after a failure, given retries already consumed
    #[must_use]
    pub const fn decide(retries_so_far: u32, max_retries: u32) -> RetryDecision {
        if retries_so_far < max_retries {
            RetryDecision::Retry {
                retry: retries_so_far + 1,
            }
        } else {
            RetryDecision::GiveUp {
                retries: retries_so_far,
            }
        }
    }
}

/// Record a failed attempt and apply the decision under the caller's lock.
///
/// On `Retry` the state ends in `Ready` with the retry counted; on `GiveUp`
/// it stays `Failed`.
pub(crate) fn apply(
    state: &mut TaskState,
    task_id: TaskId,
    max_retries: u32,
    failure: &ExecFailure,
) -> Result<RetryDecision, DataflowError> {
    state.transition(task_id, TaskStatus::Failed)?;
    state.last_failure = Some(failure.to_string());
    state.ticket = None;

    let decision = RetryPolicy::decide(state.retries, max_retries);
    if let RetryDecision::Retry { retry } = decision {
        state.retries = retry;
        state.transition(task_id, TaskStatus::Retrying)?;
        state.transition(task_id, TaskStatus::Ready)?;
    }
    Ok(decision)
}
