//! WEFT Dataflow Kernel
//!
//! Turns a stream of task submissions into a correctly ordered, concurrently
//! executing task graph. Dependencies are implicit: a task that receives
//! another task's [`AppFuture`] as an argument runs only after that future
//! resolves. Ready tasks are routed to pluggable [`Executor`] backends by
//! label, failures are retried up to a bound, and successful results can be
//! checkpointed for reuse by later runs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod executor;
pub mod future;
pub mod kernel;
pub mod monitor;
pub mod resolver;
pub mod retry;
pub mod task;

mod scheduler;

#[cfg(test)]
mod testing;

pub use checkpoint::{CheckpointManager, CheckpointStats};
pub use config::{CheckpointMode, KernelConfig};
pub use error::DataflowError;
pub use executor::{
    Completion, CompletionEvent, CompletionNotifier, ExecFailure, Executor, ExecutorError,
    ExecutorHandle, ExecutorRegistry, ExecutorStatus, FailureKind, ShutdownMode, SubmitTicket,
    WorkUnit, run_app,
};
pub use future::{AppFuture, TaskOutcome};
pub use kernel::{Kernel, KernelBuilder, RunSummary, SubmitOptions};
pub use monitor::{
    ChannelSink, FanoutSink, MonitoringSink, NullSink, RecordingSink, TaskEvent, TaskEventKind,
    TracingSink,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use task::{App, AppError, Arg, TaskArgs, TaskInfo, TaskStatus};

pub use weft_core::{Value, ValueMap};
