//! Executor interface and label-based routing.
//!
//! Backends receive a [`WorkUnit`] plus a [`Completion`] token and push
//! outcomes back through the token from whatever thread they like. The
//! kernel never polls a backend.

use crate::error::DataflowError;
use crate::task::App;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use weft_core::{TaskId, Value, ValueMap};

/// Category of an execution failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The app body returned an error
    Exception,
    /// The app body panicked
    Panic,
    /// The backend's walltime elapsed
    Timeout,
    /// The backend lost the work without reporting an outcome
    WorkerLost,
    /// The backend refused the submission
    Rejected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exception => "exception",
            Self::Panic => "panic",
            Self::Timeout => "timeout",
            Self::WorkerLost => "worker lost",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// An attempt's failure as reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecFailure {
    /// Category
    pub kind: FailureKind,
    /// Detail
    pub message: String,
}

impl ExecFailure {
    /// Create a failure
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// App body error
    pub fn exception(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Exception, message)
    }

    /// Walltime exceeded
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// Work dropped by the backend
    pub fn worker_lost(message: impl Into<String>) -> Self {
        Self::new(FailureKind::WorkerLost, message)
    }

    /// Submission refused
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Rejected, message)
    }
}

impl fmt::Display for ExecFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Executor lifecycle error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// `submit` before `start`
    #[error("executor '{label}' has not been started")]
    NotStarted {
        /// Executor label
        label: String,
    },
    /// `submit` after `shutdown`
    #[error("executor '{label}' is shutting down")]
    ShuttingDown {
        /// Executor label
        label: String,
    },
    /// The backend refused the work
    #[error("executor '{label}' rejected submission: {reason}")]
    Rejected {
        /// Executor label
        label: String,
        /// Why
        reason: String,
    },
    /// The backend failed to start
    #[error("executor '{label}' failed to start: {reason}")]
    Startup {
        /// Executor label
        label: String,
        /// Why
        reason: String,
    },
}

/// How an executor should stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Finish accepted work, then stop
    Drain,
    /// Abort outstanding work, then stop
    Cancel,
}

/// Backend-assigned handle of an accepted submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubmitTicket(pub u64);

impl fmt::Display for SubmitTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket_{}", self.0)
    }
}

/// One attempt of a task, with arguments fully resolved
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Task being executed
    pub task_id: TaskId,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Callable
    pub app: App,
    /// Positional values
    pub args: Vec<Value>,
    /// Keyword values
    pub kwargs: ValueMap,
}

impl WorkUnit {
    /// Run the app on the current thread.
    ///
    /// App errors map to `Exception`, panics to `Panic`.
    pub fn execute(&self) -> Result<Value, ExecFailure> {
        run_app(&self.app, &self.args, &self.kwargs)
    }
}

/// Invoke `app` on the current thread, mapping app errors to `Exception`
/// and panics to `Panic`
pub fn run_app(app: &App, args: &[Value], kwargs: &ValueMap) -> Result<Value, ExecFailure> {
    match catch_unwind(AssertUnwindSafe(|| app.call(args, kwargs))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ExecFailure::exception(err.message)),
        Err(payload) => Err(ExecFailure::new(FailureKind::Panic, panic_message(&*payload))),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Notification pushed by a backend
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    /// The attempt began executing
    Started {
        /// Task
        task_id: TaskId,
        /// Attempt
        attempt: u32,
    },
    /// The attempt finished
    Finished {
        /// Task
        task_id: TaskId,
        /// Attempt
        attempt: u32,
        /// Result or failure
        outcome: Result<Value, ExecFailure>,
    },
}

impl CompletionEvent {
    /// Task this event is about
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        match self {
            Self::Started { task_id, .. } | Self::Finished { task_id, .. } => *task_id,
        }
    }
}

/// Sink for completion events
pub type CompletionNotifier = Arc<dyn Fn(CompletionEvent) + Send + Sync>;

/// Push-notification token handed to a backend with each work unit.
///
/// Finishing consumes the token. A token dropped without finishing reports
/// `WorkerLost`, so an attempt can never be left without an outcome. A
/// backend that returns an error from `submit` drops the token; the kernel
/// discards that report because the attempt has already been handled.
pub struct Completion {
    task_id: TaskId,
    attempt: u32,
    notifier: Option<CompletionNotifier>,
}

impl Completion {
    /// Create a token that reports to `notifier`
    #[must_use]
    pub fn new(task_id: TaskId, attempt: u32, notifier: CompletionNotifier) -> Self {
        Self {
            task_id,
            attempt,
            notifier: Some(notifier),
        }
    }

    /// Token paired with a receiver of its events
    #[must_use]
    pub fn channel(task_id: TaskId, attempt: u32) -> (Self, crossbeam::channel::Receiver<CompletionEvent>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        let notifier: CompletionNotifier = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (Self::new(task_id, attempt, notifier), rx)
    }

    /// Task
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Attempt
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Report that execution began
    pub fn started(&self) {
        if let Some(notifier) = &self.notifier {
            notifier(CompletionEvent::Started {
                task_id: self.task_id,
                attempt: self.attempt,
            });
        }
    }

    /// Report success
    pub fn succeed(self, value: Value) {
        self.finish(Ok(value));
    }

    /// Report failure
    pub fn fail(self, failure: ExecFailure) {
        self.finish(Err(failure));
    }

    /// Report the outcome
    pub fn finish(mut self, outcome: Result<Value, ExecFailure>) {
        self.send_finished(outcome);
    }

    /// Discard the token without reporting.
    ///
    /// Only for work the backend withdrew in answer to `Executor::cancel`;
    /// the kernel settles the task itself.
    pub fn withdraw(mut self) {
        self.notifier = None;
    }

    fn send_finished(&mut self, outcome: Result<Value, ExecFailure>) {
        if let Some(notifier) = self.notifier.take() {
            notifier(CompletionEvent::Finished {
                task_id: self.task_id,
                attempt: self.attempt,
                outcome,
            });
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.notifier.is_some() {
            self.send_finished(Err(ExecFailure::worker_lost(
                "completion dropped without an outcome",
            )));
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("armed", &self.notifier.is_some())
            .finish()
    }
}

/// An execution backend
pub trait Executor: Send + Sync {
    /// Routing label
    fn label(&self) -> &str;

    /// Acquire resources; called once when the kernel is built
    ///
    /// # Errors
    ///
    /// Returns `Startup` if the backend cannot run work
    fn start(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// Accept a work unit. Must not block on its execution.
    ///
    /// # Errors
    ///
    /// Returns error if the work was not accepted; `done` must then be
    /// dropped unfinished
    fn submit(&self, work: WorkUnit, done: Completion) -> Result<SubmitTicket, ExecutorError>;

    /// Best-effort cancellation of an accepted submission.
    ///
    /// Returning `true` means the work will never run and its `Completion`
    /// was withdrawn.
    fn cancel(&self, _ticket: SubmitTicket) -> bool {
        false
    }

    /// Accepted submissions without an outcome yet
    fn outstanding(&self) -> usize;

    /// Stop the backend
    fn shutdown(&self, mode: ShutdownMode);
}

/// A registered executor plus routing statistics
pub struct ExecutorHandle {
    label: String,
    executor: Arc<dyn Executor>,
    routed: AtomicU64,
}

impl ExecutorHandle {
    fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            label: executor.label().to_string(),
            executor,
            routed: AtomicU64::new(0),
        }
    }

    /// Routing label
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The backend
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Submit and count the routing
    ///
    /// # Errors
    ///
    /// Propagates the backend's refusal
    pub fn submit(&self, work: WorkUnit, done: Completion) -> Result<SubmitTicket, ExecutorError> {
        self.routed.fetch_add(1, Ordering::Relaxed);
        self.executor.submit(work, done)
    }

    /// Submissions routed here so far
    #[must_use]
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("label", &self.label)
            .field("routed", &self.routed())
            .finish()
    }
}

/// Point-in-time view of one executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutorStatus {
    /// Label
    pub label: String,
    /// Whether unlabelled tasks go here
    pub is_default: bool,
    /// Submissions routed so far
    pub routed: u64,
    /// Backlog reported by the backend
    pub outstanding: usize,
}

/// Label to executor mapping, fixed at kernel construction
#[derive(Debug)]
pub struct ExecutorRegistry {
    executors: IndexMap<String, ExecutorHandle>,
    default_label: String,
}

impl ExecutorRegistry {
    /// Build the registry.
    ///
    /// Without an explicit default, the first executor is the default.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an empty set, duplicate labels or an
    /// unknown default label
    pub fn new(executors: Vec<Arc<dyn Executor>>, default_label: Option<&str>) -> Result<Self, DataflowError> {
        let mut map = IndexMap::with_capacity(executors.len());
        for executor in executors {
            let handle = ExecutorHandle::new(executor);
            if map.contains_key(handle.label()) {
                return Err(DataflowError::Configuration(format!(
                    "duplicate executor label '{}'",
                    handle.label()
                )));
            }
            map.insert(handle.label().to_string(), handle);
        }

        let default_label = match default_label {
            Some(label) if map.contains_key(label) => label.to_string(),
            Some(label) => {
                return Err(DataflowError::Configuration(format!(
                    "default executor '{}' is not registered",
                    label
                )));
            }
            None => map
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| DataflowError::Configuration("no executors registered".to_string()))?,
        };

        Ok(Self {
            executors: map,
            default_label,
        })
    }

    /// Label used when a task names none
    #[must_use]
    pub fn default_label(&self) -> &str {
        &self.default_label
    }

    /// Executor for `label`, or the default for `None`
    #[must_use]
    pub fn get(&self, label: Option<&str>) -> Option<&ExecutorHandle> {
        self.executors.get(label.unwrap_or(&self.default_label))
    }

    /// Registered labels, in registration order
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(String::as_str)
    }

    /// Number of registered executors
    #[must_use]
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    /// Whether no executors are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Start every executor; stops at the first failure
    ///
    /// # Errors
    ///
    /// Returns the first startup error
    pub fn start_all(&self) -> Result<(), DataflowError> {
        for handle in self.executors.values() {
            handle.executor.start()?;
            tracing::info!(executor = %handle.label, "Executor started");
        }
        Ok(())
    }

    /// Shut every executor down
    pub fn shutdown_all(&self, mode: ShutdownMode) {
        for handle in self.executors.values() {
            handle.executor.shutdown(mode);
            tracing::info!(executor = %handle.label, ?mode, "Executor shut down");
        }
    }

    /// Snapshot of all executors
    #[must_use]
    pub fn status(&self) -> Vec<ExecutorStatus> {
        self.executors
            .values()
            .map(|h| ExecutorStatus {
                label: h.label.clone(),
                is_default: h.label == self.default_label,
                routed: h.routed(),
                outstanding: h.executor.outstanding(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InlineExecutor;
    use crate::task::AppError;
    use serde_json::json;

    fn unit(app: App) -> WorkUnit {
        WorkUnit {
            task_id: TaskId::from_raw(1),
            attempt: 1,
            app,
            args: vec![json!(2)],
            kwargs: ValueMap::new(),
        }
    }

    #[test]
    fn test_execute_maps_errors_and_panics() {
        let ok = unit(App::new("double", |a, _| Ok(json!(a[0].as_i64().unwrap_or(0) * 2))));
        assert_eq!(ok.execute(), Ok(json!(4)));

        let err = unit(App::new("bad", |_, _| Err(AppError::new("nope"))));
        assert_eq!(err.execute(), Err(ExecFailure::exception("nope")));

        let panics = unit(App::new("panics", |_, _| panic!("kaboom")));
        let failure = panics.execute().unwrap_err();
        assert_eq!(failure.kind, FailureKind::Panic);
        assert!(failure.message.contains("kaboom"));
    }

    #[test]
    fn test_completion_reports_once() {
        let (done, rx) = Completion::channel(TaskId::from_raw(9), 2);
        done.started();
        done.succeed(json!("ok"));

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            CompletionEvent::Finished {
                task_id: TaskId::from_raw(9),
                attempt: 2,
                outcome: Ok(json!("ok")),
            }
        );
    }

    #[test]
    fn test_dropped_completion_reports_worker_lost() {
        let (done, rx) = Completion::channel(TaskId::from_raw(3), 1);
        drop(done);

        match rx.try_recv().unwrap() {
            CompletionEvent::Finished { outcome: Err(f), .. } => {
                assert_eq!(f.kind, FailureKind::WorkerLost);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_withdrawn_completion_is_silent() {
        let (done, rx) = Completion::channel(TaskId::from_raw(3), 1);
        done.withdraw();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_registry_default_is_first() {
        let registry = ExecutorRegistry::new(
            vec![Arc::new(InlineExecutor::new("a")), Arc::new(InlineExecutor::new("b"))],
            None,
        )
        .unwrap();
        assert_eq!(registry.default_label(), "a");
        assert_eq!(registry.get(None).unwrap().label(), "a");
        assert_eq!(registry.get(Some("b")).unwrap().label(), "b");
        assert!(registry.get(Some("c")).is_none());
        assert_eq!(registry.labels().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_registry_rejects_bad_config() {
        let dup = ExecutorRegistry::new(
            vec![Arc::new(InlineExecutor::new("a")), Arc::new(InlineExecutor::new("a"))],
            None,
        );
        assert!(matches!(dup, Err(DataflowError::Configuration(_))));

        let unknown = ExecutorRegistry::new(vec![Arc::new(InlineExecutor::new("a"))], Some("z"));
        assert!(matches!(unknown, Err(DataflowError::Configuration(_))));

        let empty = ExecutorRegistry::new(Vec::new(), None);
        assert!(matches!(empty, Err(DataflowError::Configuration(_))));
    }

    #[test]
    fn test_status_counts_routing() {
        let registry =
            ExecutorRegistry::new(vec![Arc::new(InlineExecutor::new("local"))], Some("local")).unwrap();
        let handle = registry.get(None).unwrap();
        let (done, _rx) = Completion::channel(TaskId::from_raw(1), 1);
        handle
            .submit(unit(App::new("id", |a, _| Ok(a[0].clone()))), done)
            .unwrap();

        let status = registry.status();
        assert_eq!(status.len(), 1);
        assert!(status[0].is_default);
        assert_eq!(status[0].routed, 1);
    }
}
