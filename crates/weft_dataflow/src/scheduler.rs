//! Submission loop.
//!
//! Scheduler threads drain a single event channel. Dependency callbacks and
//! executor completions only enqueue events; every state change happens here
//! (or in cancellation) under the record's own lock. Monitoring events and
//! future resolution wait until that lock is released.

use crate::error::DataflowError;
use crate::executor::{Completion, CompletionEvent, ExecFailure, WorkUnit};
use crate::future::TaskOutcome;
use crate::kernel::KernelShared;
use crate::monitor::{TaskEvent, TaskEventKind};
use crate::resolver::resolve_args;
use crate::retry::{self, RetryDecision};
use crate::task::{TaskRecord, TaskState, TaskStatus};
use crossbeam::channel::Receiver;
use parking_lot::MutexGuard;
use std::sync::Arc;
use weft_core::{CheckpointKey, TaskId, Timestamp, Value};

/// Work for the scheduler threads
#[derive(Debug)]
pub(crate) enum SchedulerEvent {
    /// Every dependency of the task succeeded
    Ready(TaskId),
    /// A dependency failed or was cancelled
    DependencyFailed {
        task: TaskId,
        dependency: TaskId,
        cause: DataflowError,
    },
    /// A backend reported progress
    Completion(CompletionEvent),
    /// Exit the loop
    Stop,
}

pub(crate) fn run(shared: Arc<KernelShared>, rx: Receiver<SchedulerEvent>) {
    tracing::debug!("Submission loop started");
    while let Ok(event) = rx.recv() {
        match event {
            SchedulerEvent::Ready(task) => on_ready(&shared, task),
            SchedulerEvent::DependencyFailed {
                task,
                dependency,
                cause,
            } => on_dependency_failed(&shared, task, dependency, cause),
            SchedulerEvent::Completion(CompletionEvent::Started { task_id, attempt }) => {
                on_started(&shared, task_id, attempt);
            }
            SchedulerEvent::Completion(CompletionEvent::Finished {
                task_id,
                attempt,
                outcome,
            }) => on_finished(&shared, task_id, attempt, outcome),
            SchedulerEvent::Stop => break,
        }
    }
    tracing::debug!("Submission loop stopped");
}

/// Follow-up that runs once the record lock is released
enum Settle {
    Nothing,
    Resolve(TaskOutcome),
    Fatal(DataflowError),
}

/// Outcome of applying the retry policy to one failed attempt
enum Next {
    Retry,
    Done(Settle),
}

fn settle(
    shared: &KernelShared,
    record: &TaskRecord,
    state: MutexGuard<'_, TaskState>,
    events: Vec<TaskEvent>,
    next: Settle,
) {
    shared.release(record, state, events);
    match next {
        Settle::Nothing => {}
        Settle::Resolve(outcome) => shared.resolve(record, outcome),
        Settle::Fatal(violation) => shared.record_fatal(violation),
    }
}

fn on_ready(shared: &KernelShared, task: TaskId) {
    let Some(record) = shared.record(task) else {
        return;
    };
    let mut state = record.state.lock();
    if state.status != TaskStatus::Pending {
        // Cancelled while its dependencies were resolving.
        return;
    }
    if shared.is_sweeping() {
        drop(state);
        shared.cancel_record(&record);
        return;
    }
    let mut events = Vec::new();
    let next = match state.transition(record.id, TaskStatus::Ready) {
        Ok(()) => dispatch(shared, &record, &mut state, &mut events),
        Err(violation) => Settle::Fatal(violation),
    };
    settle(shared, &record, state, events, next);
}

/// Route a `Ready` task: checkpoint lookup, executor selection, submission.
///
/// Rejected submissions are retried here until one is accepted or the retry
/// bound is spent.
fn dispatch(
    shared: &KernelShared,
    record: &Arc<TaskRecord>,
    state: &mut TaskState,
    events: &mut Vec<TaskEvent>,
) -> Settle {
    loop {
        let resolved = match state.resolved.clone() {
            Some(resolved) => resolved,
            None => match resolve_args(record.id, &record.args) {
                Ok(resolved) => {
                    state.resolved = Some(resolved.clone());
                    resolved
                }
                Err(err @ DataflowError::UpstreamFailure { .. }) => {
                    return fail_terminal(shared, record, state, events, err);
                }
                Err(violation) => return Settle::Fatal(violation),
            },
        };

        if record.checkpoint && shared.checkpoints.is_enabled() {
            let key = *state.checkpoint_key.get_or_insert_with(|| {
                CheckpointKey::derive(record.app.name(), &resolved.args, &resolved.kwargs)
            });
            if let Some(value) = shared.checkpoints.lookup(&key) {
                if let Err(violation) = state.transition(record.id, TaskStatus::Completed) {
                    return Settle::Fatal(violation);
                }
                tracing::debug!(task = %record.id, key = %key, "Checkpoint hit");
                events.push(shared.event(record, state, TaskEventKind::CheckpointHit, None));
                return Settle::Resolve(Ok(value));
            }
        }

        let Some(handle) = shared.executors.get(record.requested_executor.as_deref()) else {
            let label = record
                .requested_executor
                .clone()
                .unwrap_or_else(|| shared.executors.default_label().to_string());
            let err = DataflowError::UnknownExecutor {
                task_id: record.id,
                label,
            };
            return fail_terminal(shared, record, state, events, err);
        };

        if let Err(violation) = state.transition(record.id, TaskStatus::Submitted) {
            return Settle::Fatal(violation);
        }
        state.attempts += 1;
        state.executor = Some(handle.label().to_string());
        state.submitted_at.get_or_insert_with(Timestamp::now);
        let attempt = state.attempts;

        tracing::debug!(
            task = %record.id,
            app = record.app.name(),
            executor = handle.label(),
            attempt,
            "Submitting task"
        );
        events.push(shared.event(record, state, TaskEventKind::Submitted, None));

        let work = WorkUnit {
            task_id: record.id,
            attempt,
            app: record.app.clone(),
            args: resolved.args,
            kwargs: resolved.kwargs,
        };
        let done = Completion::new(record.id, attempt, Arc::clone(&shared.notifier));

        // The record lock is held across submit so a fast completion cannot be
        // handled before the ticket is stored.
        let err = match handle.submit(work, done) {
            Ok(ticket) => {
                state.ticket = Some(ticket);
                return Settle::Nothing;
            }
            Err(err) => err,
        };
        tracing::warn!(task = %record.id, error = %err, "Executor rejected submission");
        match apply_failure(shared, record, state, events, ExecFailure::rejected(err.to_string())) {
            Next::Retry => {}
            Next::Done(next) => return next,
        }
    }
}

fn on_started(shared: &KernelShared, task: TaskId, attempt: u32) {
    let Some(record) = shared.record(task) else {
        return;
    };
    let mut state = record.state.lock();
    if state.attempts != attempt || state.status != TaskStatus::Submitted {
        return;
    }
    let mut events = Vec::new();
    let next = match state.transition(record.id, TaskStatus::Running) {
        Ok(()) => {
            events.push(shared.event(&record, &state, TaskEventKind::Started, None));
            Settle::Nothing
        }
        Err(violation) => Settle::Fatal(violation),
    };
    settle(shared, &record, state, events, next);
}

fn on_finished(shared: &KernelShared, task: TaskId, attempt: u32, outcome: Result<Value, ExecFailure>) {
    let Some(record) = shared.record(task) else {
        tracing::warn!(task = %task, "Completion for unknown task");
        return;
    };
    let mut state = record.state.lock();
    let live = matches!(state.status, TaskStatus::Submitted | TaskStatus::Running);
    if state.attempts != attempt || !live {
        tracing::debug!(
            task = %task,
            attempt,
            current = state.attempts,
            status = %state.status,
            "Ignoring stale completion"
        );
        return;
    }
    state.ticket = None;

    let mut events = Vec::new();
    let value = match outcome {
        Ok(value) => value,
        Err(failure) => {
            let next = match apply_failure(shared, &record, &mut state, &mut events, failure) {
                Next::Retry => dispatch(shared, &record, &mut state, &mut events),
                Next::Done(next) => next,
            };
            settle(shared, &record, state, events, next);
            return;
        }
    };

    if let Err(violation) = state.transition(record.id, TaskStatus::Completed) {
        settle(shared, &record, state, events, Settle::Fatal(violation));
        return;
    }
    tracing::debug!(task = %record.id, attempt, "Task completed");
    events.push(shared.event(&record, &state, TaskEventKind::Completed, None));
    let key = state.checkpoint_key.filter(|_| record.checkpoint);
    shared.release(&record, state, events);

    if let Some(key) = key {
        shared.checkpoints.record(key, value.clone());
    }
    shared.resolve(&record, Ok(value));
}

/// Apply the retry decision to a failed attempt
fn apply_failure(
    shared: &KernelShared,
    record: &TaskRecord,
    state: &mut TaskState,
    events: &mut Vec<TaskEvent>,
    failure: ExecFailure,
) -> Next {
    match retry::apply(state, record.id, record.max_retries, &failure) {
        Ok(RetryDecision::Retry { retry }) => {
            tracing::warn!(
                task = %record.id,
                retry,
                max_retries = record.max_retries,
                failure = %failure,
                "Retrying task"
            );
            events.push(shared.event(record, state, TaskEventKind::Retried, Some(failure.to_string())));
            Next::Retry
        }
        Ok(RetryDecision::GiveUp { .. }) => {
            let err = DataflowError::ExecutionFailure {
                task_id: record.id,
                attempts: state.attempts,
                failure,
            };
            tracing::warn!(task = %record.id, error = %err, "Task failed");
            events.push(shared.event(record, state, TaskEventKind::Failed, Some(err.to_string())));
            Next::Done(Settle::Resolve(Err(err)))
        }
        Err(violation) => Next::Done(Settle::Fatal(violation)),
    }
}

fn on_dependency_failed(shared: &KernelShared, task: TaskId, dependency: TaskId, cause: DataflowError) {
    let Some(record) = shared.record(task) else {
        return;
    };
    let mut state = record.state.lock();
    if state.status != TaskStatus::Pending {
        return;
    }
    // Upstream failures seen during a cancel sweep are the sweep's own doing.
    if shared.is_sweeping() {
        drop(state);
        shared.cancel_record(&record);
        return;
    }
    let err = DataflowError::UpstreamFailure {
        task_id: record.id,
        dependency,
        cause: Box::new(cause),
    };
    let mut events = Vec::new();
    let next = fail_terminal(shared, &record, &mut state, &mut events, err);
    settle(shared, &record, state, events, next);
}

/// Fail without running and without retrying
fn fail_terminal(
    shared: &KernelShared,
    record: &TaskRecord,
    state: &mut TaskState,
    events: &mut Vec<TaskEvent>,
    err: DataflowError,
) -> Settle {
    if let Err(violation) = state.transition(record.id, TaskStatus::Failed) {
        return Settle::Fatal(violation);
    }
    state.last_failure = Some(err.to_string());
    tracing::debug!(task = %record.id, error = %err, "Task failed without running");
    events.push(shared.event(record, state, TaskEventKind::Failed, Some(err.to_string())));
    Settle::Resolve(Err(err))
}
