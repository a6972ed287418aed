//! Single-assignment result cells.
//!
//! An [`AppFuture`] is the eventual outcome of one task. It is shared by the
//! task that produces it and by every task that consumes it as an argument,
//! and it resolves exactly once. Retries of the producing task reuse the same
//! future, so consumers only ever observe the final outcome.

use crate::error::DataflowError;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft_core::{TaskId, Value};

/// Final outcome of a task
pub type TaskOutcome = Result<Value, DataflowError>;

type DoneCallback = Box<dyn FnOnce(&TaskOutcome) + Send + 'static>;

struct FutureState {
    outcome: Option<TaskOutcome>,
    callbacks: Vec<DoneCallback>,
}

struct Shared {
    task_id: TaskId,
    state: Mutex<FutureState>,
    resolved: Condvar,
}

/// Eventual result of a task
#[derive(Clone)]
pub struct AppFuture {
    shared: Arc<Shared>,
}

impl AppFuture {
    /// Create an unresolved future for `task_id`
    #[must_use]
    pub fn new(task_id: TaskId) -> Self {
        Self {
            shared: Arc::new(Shared {
                task_id,
                state: Mutex::new(FutureState {
                    outcome: None,
                    callbacks: Vec::new(),
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    /// Task that produces this future
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.shared.task_id
    }

    /// Whether the future has resolved
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// Outcome if already resolved
    #[must_use]
    pub fn try_outcome(&self) -> Option<TaskOutcome> {
        self.shared.state.lock().outcome.clone()
    }

    /// Resolve with a value
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the future was already resolved
    pub fn set_result(&self, value: Value) -> Result<(), DataflowError> {
        self.resolve(Ok(value))
    }

    /// Resolve with an error
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the future was already resolved
    pub fn set_error(&self, error: DataflowError) -> Result<(), DataflowError> {
        self.resolve(Err(error))
    }

    fn resolve(&self, outcome: TaskOutcome) -> Result<(), DataflowError> {
        let callbacks = {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() {
                return Err(DataflowError::ProtocolViolation {
                    task_id: self.shared.task_id,
                    reason: "future resolved more than once".to_string(),
                });
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.callbacks)
        };

        self.shared.resolved.notify_all();

        // Callbacks run on the resolving thread, outside the lock.
        for callback in callbacks {
            callback(&outcome);
        }
        Ok(())
    }

    /// Register a callback for resolution.
    ///
    /// If the future is already resolved the callback runs immediately on the
    /// calling thread; otherwise it runs on whichever thread resolves it.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&TaskOutcome) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        match &state.outcome {
            Some(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                callback(&outcome);
            }
            None => state.callbacks.push(Box::new(callback)),
        }
    }

    /// Block until the future resolves or `timeout` elapses.
    ///
    /// A deadline miss returns `TimedOut` and leaves the future untouched.
    pub fn wait(&self, timeout: Option<Duration>) -> TaskOutcome {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.shared.state.lock();

        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            match deadline {
                None => self.shared.resolved.wait(&mut state),
                Some(deadline) => {
                    let result = self.shared.resolved.wait_until(&mut state, deadline);
                    if result.timed_out() && state.outcome.is_none() {
                        return Err(DataflowError::TimedOut {
                            task_id: self.shared.task_id,
                            waited: timeout.unwrap_or_default(),
                        });
                    }
                }
            }
        }
    }

    /// Block until the future resolves
    pub fn result(&self) -> TaskOutcome {
        self.wait(None)
    }

    /// Whether both handles refer to the same cell
    #[must_use]
    pub fn ptr_eq(&self, other: &AppFuture) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for AppFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        let status = match &state.outcome {
            None => "pending",
            Some(Ok(_)) => "done",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("AppFuture")
            .field("task_id", &self.shared.task_id)
            .field("status", &status)
            .finish()
    }
}
