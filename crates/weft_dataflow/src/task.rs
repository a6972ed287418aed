//! Task records, callables and argument trees.

use crate::error::DataflowError;
use crate::executor::SubmitTicket;
use crate::future::AppFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use weft_core::{CheckpointKey, TaskId, Timestamp, Value, ValueMap};

/// Failure raised by an app body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppError {
    /// Human-readable message
    pub message: String,
}

impl AppError {
    /// Create a new app error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("JSON error: {}", err))
    }
}

type AppFn = dyn Fn(&[Value], &ValueMap) -> Result<Value, AppError> + Send + Sync;

/// A named callable.
///
/// The name is the callable's identity for checkpointing: two apps with the
/// same name are assumed to compute the same function.
#[derive(Clone)]
pub struct App {
    name: Arc<str>,
    func: Arc<AppFn>,
}

impl App {
    /// Wrap a closure
    pub fn new<F>(name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(&[Value], &ValueMap) -> Result<Value, AppError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Callable identity
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke with resolved arguments
    ///
    /// # Errors
    ///
    /// Returns whatever the app body returns
    pub fn call(&self, args: &[Value], kwargs: &ValueMap) -> Result<Value, AppError> {
        (self.func)(args, kwargs)
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App").field("name", &self.name).finish()
    }
}

/// Argument tree; futures may appear at any depth
#[derive(Debug, Clone)]
pub enum Arg {
    /// A plain value
    Value(Value),
    /// The eventual result of another task
    Future(AppFuture),
    /// A list of arguments
    List(Vec<Arg>),
    /// A keyed collection of arguments
    Map(IndexMap<String, Arg>),
}

impl From<AppFuture> for Arg {
    fn from(future: AppFuture) -> Self {
        Self::Future(future)
    }
}

impl From<&AppFuture> for Arg {
    fn from(future: &AppFuture) -> Self {
        Self::Future(future.clone())
    }
}

impl From<Vec<Arg>> for Arg {
    fn from(items: Vec<Arg>) -> Self {
        Self::List(items)
    }
}

impl From<IndexMap<String, Arg>> for Arg {
    fn from(map: IndexMap<String, Arg>) -> Self {
        Self::Map(map)
    }
}

macro_rules! arg_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(v: $ty) -> Self {
                    Self::Value(Value::from(v))
                }
            }
        )*
    };
}

arg_from_value!(Value, bool, i32, i64, u32, u64, f64, String, &str);

/// Positional and keyword arguments of a submission
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    /// Positional arguments
    pub args: Vec<Arg>,
    /// Keyword arguments, in submission order
    pub kwargs: IndexMap<String, Arg>,
}

impl TaskArgs {
    /// No arguments
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set a keyword argument
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.kwargs.insert(name.into(), arg.into());
        self
    }

    /// Whether there are no arguments at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies
    Pending,
    /// All dependencies succeeded
    Ready,
    /// Handed to an executor
    Submitted,
    /// The executor reported start
    Running,
    /// Finished with a value
    Completed,
    /// Finished with an error
    Failed,
    /// Failed and scheduled for another attempt
    Retrying,
    /// Cancelled before completion
    Cancelled,
}

impl TaskStatus {
    /// All states, in lifecycle order
    pub const ALL: [TaskStatus; 8] = [
        Self::Pending,
        Self::Ready,
        Self::Submitted,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Retrying,
        Self::Cancelled,
    ];

    /// Whether this is a final state.
    ///
    /// `Failed` is terminal to observers: the retry decision and the move to
    /// `Retrying` happen under the same record lock as the failure.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits `self -> next`
    #[must_use]
    pub const fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Ready | Failed | Cancelled) => true,
            (Ready, Submitted | Completed | Failed | Cancelled) => true,
            (Submitted, Running | Completed | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelled) => true,
            (Failed, Retrying) => true,
            (Retrying, Ready | Cancelled) => true,
            _ => false,
        }
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments with every future substituted by its value
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArgs {
    /// Positional values
    pub args: Vec<Value>,
    /// Keyword values
    pub kwargs: ValueMap,
}

/// Mutable part of a task record, guarded by the record mutex
#[derive(Debug)]
pub(crate) struct TaskState {
    pub(crate) status: TaskStatus,
    /// Executor submissions so far
    pub(crate) attempts: u32,
    pub(crate) retries: u32,
    /// Label of the executor the task was routed to
    pub(crate) executor: Option<String>,
    pub(crate) checkpoint_key: Option<CheckpointKey>,
    pub(crate) resolved: Option<ResolvedArgs>,
    pub(crate) ticket: Option<SubmitTicket>,
    pub(crate) submitted_at: Option<Timestamp>,
    pub(crate) updated_at: Timestamp,
    pub(crate) last_failure: Option<String>,
}

impl TaskState {
    fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempts: 0,
            retries: 0,
            executor: None,
            checkpoint_key: None,
            resolved: None,
            ticket: None,
            submitted_at: None,
            updated_at: Timestamp::now(),
            last_failure: None,
        }
    }

    /// Move to `next`, rejecting moves the state machine forbids
    pub(crate) fn transition(&mut self, task_id: TaskId, next: TaskStatus) -> Result<(), DataflowError> {
        if !self.status.can_transition_to(next) {
            return Err(DataflowError::ProtocolViolation {
                task_id,
                reason: format!("illegal transition {} -> {}", self.status, next),
            });
        }
        tracing::trace!(task = %task_id, from = %self.status, to = %next, "transition");
        self.status = next;
        self.updated_at = Timestamp::now();
        Ok(())
    }
}

/// Bookkeeping for one submitted task
pub(crate) struct TaskRecord {
    pub(crate) id: TaskId,
    pub(crate) app: App,
    pub(crate) args: TaskArgs,
    pub(crate) future: AppFuture,
    /// Label requested at submission; `None` routes to the default executor
    pub(crate) requested_executor: Option<String>,
    pub(crate) max_retries: u32,
    pub(crate) checkpoint: bool,
    pub(crate) dependencies: Vec<TaskId>,
    /// Unresolved dependencies plus the registration guard
    pub(crate) pending: AtomicUsize,
    pub(crate) dependency_failed: AtomicBool,
    pub(crate) state: Mutex<TaskState>,
    /// Serializes monitor delivery for this task once `state` is released
    pub(crate) publishing: Mutex<()>,
}

impl TaskRecord {
    pub(crate) fn new(
        id: TaskId,
        app: App,
        args: TaskArgs,
        requested_executor: Option<String>,
        max_retries: u32,
        checkpoint: bool,
    ) -> Self {
        let dependencies = crate::resolver::collect_futures(&args)
            .iter()
            .map(AppFuture::task_id)
            .collect();
        Self {
            id,
            app,
            args,
            future: AppFuture::new(id),
            requested_executor,
            max_retries,
            checkpoint,
            dependencies,
            pending: AtomicUsize::new(0),
            dependency_failed: AtomicBool::new(false),
            state: Mutex::new(TaskState::new()),
            publishing: Mutex::new(()),
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub(crate) fn info(&self) -> TaskInfo {
        let state = self.state.lock();
        TaskInfo {
            task_id: self.id,
            app: self.app.name().to_string(),
            status: state.status,
            attempts: state.attempts,
            retries: state.retries,
            max_retries: self.max_retries,
            executor: state
                .executor
                .clone()
                .or_else(|| self.requested_executor.clone()),
            checkpoint: self.checkpoint,
            checkpoint_key: state.checkpoint_key.map(|k| k.to_hex()),
            dependencies: self.dependencies.clone(),
            submitted_at: state.submitted_at,
            updated_at: state.updated_at,
            last_failure: state.last_failure.clone(),
        }
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("app", &self.app.name())
            .field("status", &self.status())
            .finish()
    }
}

/// Snapshot of a task record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    /// Task id
    pub task_id: TaskId,
    /// Callable name
    pub app: String,
    /// Current status
    pub status: TaskStatus,
    /// Executor submissions so far
    pub attempts: u32,
    /// Retries consumed
    pub retries: u32,
    /// Retry bound
    pub max_retries: u32,
    /// Executor label, once routed or if requested
    pub executor: Option<String>,
    /// Whether the result is checkpointed
    pub checkpoint: bool,
    /// Checkpoint key in hex, once computed
    pub checkpoint_key: Option<String>,
    /// Producing tasks of every future argument
    pub dependencies: Vec<TaskId>,
    /// First submission to an executor
    pub submitted_at: Option<Timestamp>,
    /// Last state change
    pub updated_at: Timestamp,
    /// Most recent failure message
    pub last_failure: Option<String>,
}
