//! In-crate executors and apps for kernel tests.

use crate::executor::{Completion, Executor, ExecutorError, ShutdownMode, SubmitTicket, WorkUnit};
use crate::task::{App, AppError};
use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use weft_core::TaskId;

/// Runs each unit synchronously inside `submit`
pub(crate) struct InlineExecutor {
    label: String,
    next_ticket: AtomicU64,
    per_task: Mutex<HashMap<TaskId, usize>>,
}

impl InlineExecutor {
    pub(crate) fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            next_ticket: AtomicU64::new(0),
            per_task: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn submitted(&self) -> usize {
        self.per_task.lock().values().sum()
    }

    pub(crate) fn submissions_for(&self, task: TaskId) -> usize {
        self.per_task.lock().get(&task).copied().unwrap_or(0)
    }
}

impl Executor for InlineExecutor {
    fn label(&self) -> &str {
        &self.label
    }

    fn submit(&self, work: WorkUnit, done: Completion) -> Result<SubmitTicket, ExecutorError> {
        *self.per_task.lock().entry(work.task_id).or_insert(0) += 1;
        done.started();
        done.finish(work.execute());
        Ok(SubmitTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed)))
    }

    fn outstanding(&self) -> usize {
        0
    }

    fn shutdown(&self, _mode: ShutdownMode) {}
}

/// Hands every unit to the test, which completes it by hand
pub(crate) struct ManualExecutor {
    label: String,
    tx: Sender<(WorkUnit, Completion)>,
    rx: Receiver<(WorkUnit, Completion)>,
    reject: AtomicUsize,
    shut_down: AtomicBool,
    next_ticket: AtomicU64,
}

impl ManualExecutor {
    pub(crate) fn new(label: &str) -> Self {
        let (tx, rx) = crossbeam::channel::unbounded();
        Self {
            label: label.to_string(),
            tx,
            rx,
            reject: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Refuse the next `n` submissions
    pub(crate) fn reject_next(&self, n: usize) {
        self.reject.store(n, Ordering::SeqCst);
    }

    pub(crate) fn next_submission(&self, timeout: Option<Duration>) -> Option<(WorkUnit, Completion)> {
        match timeout {
            Some(t) => self.rx.recv_timeout(t).ok(),
            None => self.rx.recv().ok(),
        }
    }

    pub(crate) fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Executor for ManualExecutor {
    fn label(&self) -> &str {
        &self.label
    }

    fn submit(&self, work: WorkUnit, done: Completion) -> Result<SubmitTicket, ExecutorError> {
        let rejected = self
            .reject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(ExecutorError::Rejected {
                label: self.label.clone(),
                reason: "test rejection".to_string(),
            });
        }
        let _ = self.tx.send((work, done));
        Ok(SubmitTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed)))
    }

    fn outstanding(&self) -> usize {
        self.rx.len()
    }

    fn shutdown(&self, _mode: ShutdownMode) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Sums every integer in its arguments, descending into lists
pub(crate) fn add_app() -> App {
    fn sum(value: &Value) -> i64 {
        match value {
            Value::Array(items) => items.iter().map(sum).sum(),
            other => other.as_i64().unwrap_or(0),
        }
    }
    App::new("add", |args, kwargs| {
        Ok(json!(args.iter().chain(kwargs.values()).map(sum).sum::<i64>()))
    })
}

/// Fails its first `fail_times` calls, then returns 1
pub(crate) fn flaky_app(name: &str, fail_times: u32) -> App {
    let calls = Arc::new(AtomicU32::new(0));
    App::new(name.to_string(), move |_, _| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        if call < fail_times {
            Err(AppError::new(format!("planned failure {}", call + 1)))
        } else {
            Ok(json!(1))
        }
    })
}
