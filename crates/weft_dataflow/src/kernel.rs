//! Kernel API: submission, waiting, cancellation and shutdown.

use crate::checkpoint::{CheckpointManager, CheckpointStats};
use crate::config::{CheckpointMode, KernelConfig};
use crate::error::DataflowError;
use crate::executor::{CompletionNotifier, Executor, ExecutorRegistry, ExecutorStatus, ShutdownMode};
use crate::future::{AppFuture, TaskOutcome};
use crate::monitor::{MonitoringSink, NullSink, TaskEvent, TaskEventKind, emit_guarded};
use crate::resolver::DependencyResolver;
use crate::scheduler::{self, SchedulerEvent};
use crate::task::{App, TaskArgs, TaskInfo, TaskRecord, TaskState, TaskStatus};
use crossbeam::channel::{Receiver, Sender};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use weft_core::{CheckpointStore, RunId, TaskId, TaskIdGenerator, Timestamp};

/// Per-submission overrides of the kernel defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Executor label; the default executor when unset
    pub executor: Option<String>,
    /// Whether to checkpoint; `checkpoint_by_default` when unset
    pub checkpoint: Option<bool>,
    /// Retry bound; the configured `retries` when unset
    pub max_retries: Option<u32>,
}

impl SubmitOptions {
    /// Kernel defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route to `label`
    #[must_use]
    pub fn executor(mut self, label: impl Into<String>) -> Self {
        self.executor = Some(label.into());
        self
    }

    /// Enable or disable checkpointing
    #[must_use]
    pub fn checkpoint(mut self, enabled: bool) -> Self {
        self.checkpoint = Some(enabled);
        self
    }

    /// Override the retry bound
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// Counts of tasks per status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Run
    pub run_id: RunId,
    /// Tasks submitted
    pub total: usize,
    /// Tasks per status
    pub by_status: BTreeMap<TaskStatus, usize>,
    /// Checkpoint counters
    pub checkpoints: CheckpointStats,
}

impl RunSummary {
    /// Tasks in `status`
    #[must_use]
    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Whether every task reached a final state
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.by_status
            .iter()
            .all(|(status, count)| status.is_terminal() || *count == 0)
    }
}

/// State shared by the kernel handle and its scheduler threads
pub(crate) struct KernelShared {
    pub(crate) run_id: RunId,
    pub(crate) config: KernelConfig,
    tasks: RwLock<HashMap<TaskId, Arc<TaskRecord>>>,
    ids: TaskIdGenerator,
    pub(crate) executors: ExecutorRegistry,
    pub(crate) checkpoints: CheckpointManager,
    monitor: Arc<dyn MonitoringSink>,
    events: Sender<SchedulerEvent>,
    pub(crate) notifier: CompletionNotifier,
    accepting: AtomicBool,
    sweeping: AtomicBool,
    executors_stopped: AtomicBool,
    fatal: Mutex<Option<DataflowError>>,
}

impl KernelShared {
    pub(crate) fn record(&self, task: TaskId) -> Option<Arc<TaskRecord>> {
        self.tasks.read().get(&task).cloned()
    }

    fn records(&self) -> Vec<Arc<TaskRecord>> {
        let mut records: Vec<_> = self.tasks.read().values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }

    fn accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Whether a cancel sweep has begun; non-final tasks only move to `Cancelled` from then on
    pub(crate) fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    pub(crate) fn event(
        &self,
        record: &TaskRecord,
        state: &TaskState,
        kind: TaskEventKind,
        message: Option<String>,
    ) -> TaskEvent {
        TaskEvent {
            run_id: self.run_id,
            task_id: record.id,
            app: record.app.name().to_string(),
            kind,
            status: state.status,
            attempt: state.attempts,
            executor: state.executor.clone(),
            timestamp: Timestamp::now(),
            message,
        }
    }

    /// Unlock `state`, then hand `events` to the monitor.
    ///
    /// The record's publish lock is taken before the state lock is released,
    /// so a task's events reach the sink in transition order.
    pub(crate) fn release(
        &self,
        record: &TaskRecord,
        state: MutexGuard<'_, TaskState>,
        events: Vec<TaskEvent>,
    ) {
        if events.is_empty() {
            return;
        }
        let publishing = record.publishing.lock();
        drop(state);
        for event in &events {
            emit_guarded(self.monitor.as_ref(), event);
        }
        drop(publishing);
    }

    /// Resolve a record's future; a second resolution is fatal
    pub(crate) fn resolve(&self, record: &TaskRecord, outcome: TaskOutcome) {
        let result = match outcome {
            Ok(value) => record.future.set_result(value),
            Err(err) => record.future.set_error(err),
        };
        if let Err(violation) = result {
            self.record_fatal(violation);
        }
    }

    /// Keep the first fatal error, stop accepting work and cancel the rest
    pub(crate) fn record_fatal(&self, err: DataflowError) {
        tracing::error!(error = %err, "Fatal kernel error; cancelling outstanding tasks");
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(err);
            }
        }
        self.accepting.store(false, Ordering::Release);
        self.cancel_all();
        self.stop_executors(ShutdownMode::Cancel);
    }

    /// Cancel one record if it is not final. Returns whether it was cancelled.
    pub(crate) fn cancel_record(&self, record: &TaskRecord) -> bool {
        let mut state = record.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        let ticket = state.ticket.take();
        let label = state.executor.clone();
        if state.transition(record.id, TaskStatus::Cancelled).is_err() {
            return false;
        }
        state.last_failure = Some("cancelled".to_string());
        let event = self.event(record, &state, TaskEventKind::Cancelled, None);
        self.release(record, state, vec![event]);

        if let Some(ticket) = ticket {
            if let Some(handle) = self.executors.get(label.as_deref()) {
                handle.executor().cancel(ticket);
            }
        }
        tracing::debug!(task = %record.id, "Task cancelled");
        self.resolve(record, Err(DataflowError::Cancelled { task_id: record.id }));
        true
    }

    fn cancel_all(&self) -> usize {
        self.sweeping.store(true, Ordering::Release);
        self.records()
            .iter()
            .filter(|record| self.cancel_record(record))
            .count()
    }

    /// Stop and join scheduler threads
    fn stop_schedulers(&self, handles: Vec<JoinHandle<()>>) {
        for _ in 0..handles.len() {
            let _ = self.events.send(SchedulerEvent::Stop);
        }
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Scheduler thread panicked");
            }
        }
    }

    /// Spawn `threads` scheduler loops; on failure the ones already running are stopped
    fn spawn_schedulers(
        self: &Arc<Self>,
        rx: &Receiver<SchedulerEvent>,
        threads: usize,
    ) -> Result<Vec<JoinHandle<()>>, DataflowError> {
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let worker_shared = Arc::clone(self);
            let rx = rx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("weft-submit-{i}"))
                .spawn(move || scheduler::run(worker_shared, rx));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.stop_schedulers(handles);
                    return Err(DataflowError::Internal(format!(
                        "failed to spawn scheduler thread: {e}"
                    )));
                }
            }
        }
        Ok(handles)
    }

    fn stop_executors(&self, mode: ShutdownMode) {
        if !self.executors_stopped.swap(true, Ordering::AcqRel) {
            self.executors.shutdown_all(mode);
        }
    }

    fn summary(&self) -> RunSummary {
        let records = self.records();
        let mut by_status: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for record in &records {
            *by_status.entry(record.status()).or_insert(0) += 1;
        }
        RunSummary {
            run_id: self.run_id,
            total: records.len(),
            by_status,
            checkpoints: self.checkpoints.stats(),
        }
    }
}

/// Builder for [`Kernel`]
pub struct KernelBuilder {
    config: KernelConfig,
    executors: Vec<Arc<dyn Executor>>,
    store: Option<Arc<dyn CheckpointStore>>,
    monitor: Option<Arc<dyn MonitoringSink>>,
    run_id: Option<RunId>,
}

impl KernelBuilder {
    /// Register an executor; the first one is the default unless configured
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Persist checkpoints to `store`
    #[must_use]
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Send task events to `sink`
    #[must_use]
    pub fn monitor(mut self, sink: Arc<dyn MonitoringSink>) -> Self {
        self.monitor = Some(sink);
        self
    }

    /// Use a fixed run id
    #[must_use]
    pub fn run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Start executors, load checkpoints and spawn scheduler threads
    ///
    /// # Errors
    ///
    /// Returns error for invalid configuration, executor startup failure or
    /// an unreadable checkpoint store
    pub fn build(self) -> Result<Kernel, DataflowError> {
        self.config.validate()?;
        let executors =
            ExecutorRegistry::new(self.executors, self.config.default_executor.as_deref())?;
        let checkpoints = CheckpointManager::new(self.config.checkpoint_mode, self.store);
        checkpoints.load()?;
        executors.start_all()?;

        let (tx, rx) = crossbeam::channel::unbounded();
        let notify_tx = tx.clone();
        let notifier: CompletionNotifier = Arc::new(move |event| {
            let _ = notify_tx.send(SchedulerEvent::Completion(event));
        });

        let run_id = self.run_id.unwrap_or_default();
        let threads = self.config.submission_threads;
        let shared = Arc::new(KernelShared {
            run_id,
            config: self.config,
            tasks: RwLock::new(HashMap::new()),
            ids: TaskIdGenerator::new(),
            executors,
            checkpoints,
            monitor: self.monitor.unwrap_or_else(|| Arc::new(NullSink)),
            events: tx,
            notifier,
            accepting: AtomicBool::new(true),
            sweeping: AtomicBool::new(false),
            executors_stopped: AtomicBool::new(false),
            fatal: Mutex::new(None),
        });

        let handles = match shared.spawn_schedulers(&rx, threads) {
            Ok(handles) => handles,
            Err(e) => {
                shared.stop_executors(ShutdownMode::Cancel);
                return Err(e);
            }
        };

        tracing::info!(
            run = %run_id,
            executors = ?shared.executors.labels().collect::<Vec<_>>(),
            checkpoint_mode = ?shared.config.checkpoint_mode,
            threads,
            "Kernel started"
        );

        Ok(Kernel {
            shared,
            threads: Mutex::new(handles),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Dataflow kernel
pub struct Kernel {
    shared: Arc<KernelShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Kernel {
    /// Start configuring a kernel
    #[must_use]
    pub fn builder(config: KernelConfig) -> KernelBuilder {
        KernelBuilder {
            config,
            executors: Vec::new(),
            store: None,
            monitor: None,
            run_id: None,
        }
    }

    /// Submit `app` with `args`; never blocks.
    ///
    /// Futures embedded in `args` become dependencies. After shutdown the
    /// returned future is already resolved with `Cancelled`.
    pub fn submit(&self, app: App, args: TaskArgs, options: SubmitOptions) -> AppFuture {
        let shared = &self.shared;
        let id = shared.ids.next_id();

        if !shared.accepting() {
            tracing::warn!(task = %id, app = app.name(), "Submission after shutdown");
            let future = AppFuture::new(id);
            let _ = future.set_error(DataflowError::Cancelled { task_id: id });
            return future;
        }

        let record = Arc::new(TaskRecord::new(
            id,
            app,
            args,
            options.executor,
            options.max_retries.unwrap_or(shared.config.retries),
            options.checkpoint.unwrap_or(shared.config.checkpoint_by_default),
        ));
        let future = record.future.clone();
        shared.tasks.write().insert(id, Arc::clone(&record));

        // A shutdown may have swept the table between the check and the insert.
        if !shared.accepting() {
            shared.cancel_record(&record);
            return future;
        }

        let deps = DependencyResolver::register(&record, &shared.events);
        tracing::debug!(task = %id, app = record.app.name(), deps, "Task submitted");
        future
    }

    /// Convenience for `submit` with default options
    pub fn submit_default(&self, app: App, args: TaskArgs) -> AppFuture {
        self.submit(app, args, SubmitOptions::default())
    }

    /// Wait for every future, sharing one deadline; outcomes in input order
    pub fn wait_for_all(&self, futures: &[AppFuture], timeout: Option<Duration>) -> Vec<TaskOutcome> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        futures
            .iter()
            .map(|future| match deadline {
                None => future.result(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    future.wait(Some(remaining))
                }
            })
            .collect()
    }

    /// Cancel the task behind `future`.
    ///
    /// Tasks not yet submitted are always cancelled. Submitted or running
    /// tasks are cancelled only if their executor withdraws the work.
    pub fn cancel(&self, future: &AppFuture) -> bool {
        let Some(record) = self.shared.record(future.task_id()) else {
            return false;
        };

        let (status, ticket, label) = {
            let state = record.state.lock();
            (state.status, state.ticket, state.executor.clone())
        };
        match status {
            TaskStatus::Submitted | TaskStatus::Running => {
                let withdrawn = match (ticket, self.shared.executors.get(label.as_deref())) {
                    (Some(ticket), Some(handle)) => handle.executor().cancel(ticket),
                    _ => false,
                };
                withdrawn && self.shared.cancel_record(&record)
            }
            _ => self.shared.cancel_record(&record),
        }
    }

    /// Stop the kernel. Idempotent.
    ///
    /// With `cancel_pending` every unfinished task is cancelled. Otherwise
    /// outstanding tasks are awaited, bounded by `shutdown_timeout_ms`, and
    /// whatever remains at the deadline is cancelled.
    pub fn shutdown(&self, cancel_pending: bool) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = &self.shared;
        shared.accepting.store(false, Ordering::Release);
        tracing::info!(run = %shared.run_id, cancel_pending, "Kernel shutting down");

        let mode = if cancel_pending {
            let cancelled = shared.cancel_all();
            tracing::debug!(cancelled, "Cancelled pending tasks");
            ShutdownMode::Cancel
        } else {
            let futures: Vec<_> = shared.records().iter().map(|r| r.future.clone()).collect();
            let outcomes = self.wait_for_all(&futures, shared.config.shutdown_timeout());
            if outcomes.iter().any(|o| matches!(o, Err(e) if e.is_timed_out())) {
                let cancelled = shared.cancel_all();
                tracing::warn!(cancelled, "Shutdown timeout elapsed; cancelled remaining tasks");
                ShutdownMode::Cancel
            } else {
                ShutdownMode::Drain
            }
        };

        shared.stop_executors(mode);

        if shared.checkpoints.mode() == CheckpointMode::RunExit {
            if let Err(e) = shared.checkpoints.flush() {
                tracing::warn!(error = %e, "Checkpoint flush at shutdown failed");
            }
        } else if shared.checkpoints.buffered() > 0 {
            tracing::warn!(
                entries = shared.checkpoints.buffered(),
                "Unflushed manual checkpoints discarded"
            );
        }

        let handles = std::mem::take(&mut *self.threads.lock());
        shared.stop_schedulers(handles);
        shared.monitor.flush();

        let summary = shared.summary();
        tracing::info!(
            run = %shared.run_id,
            total = summary.total,
            completed = summary.count(TaskStatus::Completed),
            failed = summary.count(TaskStatus::Failed),
            cancelled = summary.count(TaskStatus::Cancelled),
            "Kernel stopped"
        );
    }

    /// Persist buffered checkpoint entries; returns how many were written
    ///
    /// # Errors
    ///
    /// Returns `Checkpoint` if the store rejects the batch
    pub fn checkpoint(&self) -> Result<usize, DataflowError> {
        self.shared.checkpoints.flush()
    }

    /// Run identifier
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.shared.run_id
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.shared.config
    }

    /// Whether `submit` still accepts work
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting()
    }

    /// Current status of a task
    #[must_use]
    pub fn task_status(&self, task: TaskId) -> Option<TaskStatus> {
        self.shared.record(task).map(|r| r.status())
    }

    /// Snapshot of a task record
    #[must_use]
    pub fn task_info(&self, task: TaskId) -> Option<TaskInfo> {
        self.shared.record(task).map(|r| r.info())
    }

    /// Snapshot of every task, in submission order
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.shared.records().iter().map(|r| r.info()).collect()
    }

    /// Counts per status
    #[must_use]
    pub fn summary(&self) -> RunSummary {
        self.shared.summary()
    }

    /// Per-executor routing and backlog
    #[must_use]
    pub fn executor_status(&self) -> Vec<ExecutorStatus> {
        self.shared.executors.status()
    }

    /// First fatal error of the run, if any
    #[must_use]
    pub fn fatal_error(&self) -> Option<DataflowError> {
        self.shared.fatal.lock().clone()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("run_id", &self.shared.run_id)
            .field("accepting", &self.shared.accepting())
            .field("tasks", &self.shared.tasks.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FailureKind;
    use crate::monitor::RecordingSink;
    use crate::task::{AppError, Arg};
    use crate::testing::{InlineExecutor, ManualExecutor, add_app, flaky_app};
    use serde_json::json;

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    fn inline_kernel(config: KernelConfig) -> (Kernel, Arc<InlineExecutor>, Arc<RecordingSink>) {
        let executor = Arc::new(InlineExecutor::new("local"));
        let sink = Arc::new(RecordingSink::new());
        let kernel = Kernel::builder(config)
            .executor(executor.clone())
            .monitor(sink.clone())
            .build()
            .unwrap();
        (kernel, executor, sink)
    }

    #[test]
    fn test_independent_task_runs() {
        let (kernel, executor, _) = inline_kernel(KernelConfig::default());
        let f = kernel.submit_default(add_app(), TaskArgs::new().arg(1).arg(2));
        assert_eq!(f.wait(WAIT), Ok(json!(3)));
        assert_eq!(executor.submitted(), 1);
        assert_eq!(kernel.task_status(f.task_id()), Some(TaskStatus::Completed));
    }

    #[test]
    fn test_dependency_value_flows() {
        let (kernel, _, _) = inline_kernel(KernelConfig::default());
        let a = kernel.submit_default(add_app(), TaskArgs::new().arg(1).arg(1));
        let b = kernel.submit_default(add_app(), TaskArgs::new().arg(&a).arg(10));
        let c = kernel.submit_default(
            add_app(),
            TaskArgs::new().arg(Arg::List(vec![Arg::from(&a), Arg::from(&b)])),
        );
        assert_eq!(b.wait(WAIT), Ok(json!(12)));
        assert_eq!(c.wait(WAIT), Ok(json!(14)));

        let info = kernel.task_info(c.task_id()).unwrap();
        assert_eq!(info.dependencies, vec![a.task_id(), b.task_id()]);
    }

    #[test]
    fn test_causality_dependent_waits_for_manual_completion() {
        let manual = Arc::new(ManualExecutor::new("manual"));
        let kernel = Kernel::builder(KernelConfig::default())
            .executor(manual.clone())
            .build()
            .unwrap();

        let a = kernel.submit_default(add_app(), TaskArgs::new().arg(1));
        let b = kernel.submit_default(add_app(), TaskArgs::new().arg(&a));

        let first = manual.next_submission(WAIT).unwrap();
        assert_eq!(first.0.task_id, a.task_id());
        assert!(manual.next_submission(Some(Duration::from_millis(50))).is_none());
        assert_eq!(kernel.task_status(b.task_id()), Some(TaskStatus::Pending));

        first.1.started();
        first.1.succeed(json!(5));

        let second = manual.next_submission(WAIT).unwrap();
        assert_eq!(second.0.task_id, b.task_id());
        assert_eq!(second.0.args, vec![json!(5)]);
        second.1.succeed(json!(6));
        assert_eq!(b.wait(WAIT), Ok(json!(6)));
    }

    #[test]
    fn test_retry_then_success_resolves_once() {
        let (kernel, executor, sink) = inline_kernel(KernelConfig::default());
        let a = kernel.submit(flaky_app("a", 1), TaskArgs::new(), SubmitOptions::new().max_retries(1));
        let b = kernel.submit_default(add_app(), TaskArgs::new().arg(&a).arg(1));

        assert_eq!(a.wait(WAIT), Ok(json!(1)));
        assert_eq!(b.wait(WAIT), Ok(json!(2)));
        assert_eq!(executor.submissions_for(a.task_id()), 2);
        assert_eq!(sink.count(TaskEventKind::Retried), 1);

        let info = kernel.task_info(a.task_id()).unwrap();
        assert_eq!((info.attempts, info.retries), (2, 1));
    }

    #[test]
    fn test_retry_bound_is_n_plus_one() {
        let (kernel, executor, _) = inline_kernel(KernelConfig::default().with_retries(3));
        let a = kernel.submit_default(flaky_app("always", u32::MAX), TaskArgs::new());

        let err = a.wait(WAIT).unwrap_err();
        match err {
            DataflowError::ExecutionFailure { attempts, failure, .. } => {
                assert_eq!(attempts, 4);
                assert_eq!(failure.kind, FailureKind::Exception);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(executor.submissions_for(a.task_id()), 4);
    }

    #[test]
    fn test_permanent_failure_short_circuits_dependents() {
        let (kernel, executor, _) = inline_kernel(KernelConfig::default());
        let bad = App::new("bad", |_, _| Err(AppError::new("nope")));
        let a = kernel.submit_default(bad, TaskArgs::new());
        let b = kernel.submit_default(add_app(), TaskArgs::new().arg(&a));
        let c = kernel.submit_default(add_app(), TaskArgs::new().arg(&b));

        let err = c.wait(WAIT).unwrap_err();
        assert!(err.is_upstream_failure());
        assert!(matches!(err.root_cause(), DataflowError::ExecutionFailure { .. }));
        assert!(b.wait(WAIT).unwrap_err().is_upstream_failure());
        assert_eq!(executor.submissions_for(b.task_id()), 0);
        assert_eq!(executor.submissions_for(c.task_id()), 0);
        assert_eq!(kernel.summary().count(TaskStatus::Failed), 3);
    }

    #[test]
    fn test_unknown_executor_fails_task() {
        let (kernel, _, _) = inline_kernel(KernelConfig::default());
        let f = kernel.submit(add_app(), TaskArgs::new(), SubmitOptions::new().executor("gpu"));
        assert!(matches!(
            f.wait(WAIT),
            Err(DataflowError::UnknownExecutor { label, .. }) if label == "gpu"
        ));
    }

    #[test]
    fn test_rejected_submission_uses_retry_bound() {
        let manual = Arc::new(ManualExecutor::new("manual"));
        manual.reject_next(2);
        let kernel = Kernel::builder(KernelConfig::default().with_retries(2))
            .executor(manual.clone())
            .build()
            .unwrap();

        let f = kernel.submit_default(add_app(), TaskArgs::new().arg(4));
        let (work, done) = manual.next_submission(WAIT).unwrap();
        assert_eq!(work.attempt, 3);
        done.succeed(json!(4));
        assert_eq!(f.wait(WAIT), Ok(json!(4)));
    }

    #[test]
    fn test_dropped_completion_is_worker_lost() {
        let manual = Arc::new(ManualExecutor::new("manual"));
        let kernel = Kernel::builder(KernelConfig::default())
            .executor(manual.clone())
            .build()
            .unwrap();

        let f = kernel.submit_default(add_app(), TaskArgs::new());
        let (_work, done) = manual.next_submission(WAIT).unwrap();
        drop(done);
        match f.wait(WAIT) {
            Err(DataflowError::ExecutionFailure { failure, .. }) => {
                assert_eq!(failure.kind, FailureKind::WorkerLost);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let manual = Arc::new(ManualExecutor::new("manual"));
        let kernel = Kernel::builder(KernelConfig::default().with_retries(1))
            .executor(manual.clone())
            .build()
            .unwrap();

        let f = kernel.submit_default(add_app(), TaskArgs::new());
        let (_, first) = manual.next_submission(WAIT).unwrap();
        first.fail(crate::executor::ExecFailure::exception("flake"));

        let (work, second) = manual.next_submission(WAIT).unwrap();
        assert_eq!(work.attempt, 2);
        second.succeed(json!("second"));
        assert_eq!(f.wait(WAIT), Ok(json!("second")));
        assert!(kernel.fatal_error().is_none());
    }

    #[test]
    fn test_cancel_before_submission() {
        let manual = Arc::new(ManualExecutor::new("manual"));
        let kernel = Kernel::builder(KernelConfig::default())
            .executor(manual.clone())
            .build()
            .unwrap();

        let a = kernel.submit_default(add_app(), TaskArgs::new());
        let b = kernel.submit_default(add_app(), TaskArgs::new().arg(&a));
        let _held = manual.next_submission(WAIT).unwrap();

        assert!(kernel.cancel(&b));
        assert!(b.wait(WAIT).unwrap_err().is_cancelled());
        assert!(!kernel.cancel(&b));

        // Running work stays unless the backend withdraws it.
        assert!(!kernel.cancel(&a));
        assert!(!a.is_done());
    }

    #[test]
    fn test_shutdown_cancel_pending_resolves_everything() {
        let manual = Arc::new(ManualExecutor::new("manual"));
        let kernel = Kernel::builder(KernelConfig::default())
            .executor(manual.clone())
            .build()
            .unwrap();

        let a = kernel.submit_default(add_app(), TaskArgs::new());
        let b = kernel.submit_default(add_app(), TaskArgs::new().arg(&a));
        let held = manual.next_submission(WAIT).unwrap();

        kernel.shutdown(true);
        assert!(a.wait(WAIT).unwrap_err().is_cancelled());
        assert!(b.wait(WAIT).unwrap_err().is_cancelled());
        assert!(manual.was_shut_down());

        // Late completion after shutdown is harmless.
        held.1.succeed(json!(1));
        assert!(kernel.fatal_error().is_none());

        let late = kernel.submit_default(add_app(), TaskArgs::new());
        assert!(late.try_outcome().unwrap().unwrap_err().is_cancelled());

        kernel.shutdown(true);
    }

    #[test]
    fn test_drain_shutdown_with_timeout_cancels_stragglers() {
        let manual = Arc::new(ManualExecutor::new("manual"));
        let kernel = Kernel::builder(
            KernelConfig::default().with_shutdown_timeout(Duration::from_millis(50)),
        )
        .executor(manual.clone())
        .build()
        .unwrap();

        let a = kernel.submit_default(add_app(), TaskArgs::new());
        let _held = manual.next_submission(WAIT).unwrap();
        kernel.shutdown(false);
        assert!(a.wait(WAIT).unwrap_err().is_cancelled());
    }

    #[test]
    fn test_drain_shutdown_waits_for_work() {
        let (kernel, _, _) = inline_kernel(KernelConfig::default());
        let futures: Vec<_> = (0..20)
            .map(|i| kernel.submit_default(add_app(), TaskArgs::new().arg(i)))
            .collect();
        kernel.shutdown(false);
        for (i, f) in futures.iter().enumerate() {
            assert_eq!(f.try_outcome(), Some(Ok(json!(i))));
        }
        assert!(kernel.summary().is_finished());
    }

    #[test]
    fn test_wait_for_all_preserves_order_and_times_out() {
        let manual = Arc::new(ManualExecutor::new("manual"));
        let kernel = Kernel::builder(KernelConfig::default())
            .executor(manual.clone())
            .build()
            .unwrap();

        let a = kernel.submit_default(add_app(), TaskArgs::new());
        let b = kernel.submit_default(add_app(), TaskArgs::new());
        let (work, done) = manual.next_submission(WAIT).unwrap();
        let _other = manual.next_submission(WAIT).unwrap();
        assert_eq!(work.task_id, a.task_id());
        done.succeed(json!("a"));

        let outcomes = kernel.wait_for_all(&[a, b], Some(Duration::from_millis(50)));
        assert_eq!(outcomes[0], Ok(json!("a")));
        assert!(outcomes[1].as_ref().unwrap_err().is_timed_out());
    }

    #[test]
    fn test_checkpoint_hit_within_run() {
        let (kernel, executor, sink) = inline_kernel(KernelConfig::default().with_checkpoint_by_default(true));
        let first = kernel.submit_default(add_app(), TaskArgs::new().arg(2).arg(3));
        assert_eq!(first.wait(WAIT), Ok(json!(5)));
        let second = kernel.submit_default(add_app(), TaskArgs::new().arg(2).arg(3));
        assert_eq!(second.wait(WAIT), Ok(json!(5)));

        assert_eq!(executor.submitted(), 1);
        assert_eq!(sink.count(TaskEventKind::CheckpointHit), 1);
        assert_eq!(kernel.summary().checkpoints.hits, 1);
    }

    #[test]
    fn test_events_follow_lifecycle() {
        let (kernel, _, sink) = inline_kernel(KernelConfig::default());
        let f = kernel.submit_default(add_app(), TaskArgs::new().arg(1));
        f.wait(WAIT).unwrap();
        kernel.shutdown(false);

        let kinds: Vec<_> = sink.events_for(f.task_id()).iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![TaskEventKind::Submitted, TaskEventKind::Started, TaskEventKind::Completed]
        );
    }

    #[test]
    fn test_multiple_submission_threads() {
        let (kernel, _, _) = inline_kernel(KernelConfig::default().with_submission_threads(4));
        let mut prev = kernel.submit_default(add_app(), TaskArgs::new().arg(0));
        for _ in 0..50 {
            prev = kernel.submit_default(add_app(), TaskArgs::new().arg(&prev).arg(1));
        }
        assert_eq!(prev.wait(WAIT), Ok(json!(50)));
    }

    #[test]
    fn test_double_resolution_is_fatal() {
        let manual = Arc::new(ManualExecutor::new("manual"));
        let kernel = Kernel::builder(KernelConfig::default())
            .executor(manual.clone())
            .build()
            .unwrap();

        let a = kernel.submit_default(add_app(), TaskArgs::new());
        let blocker = AppFuture::new(TaskId::from_raw(u64::MAX));
        let b = kernel.submit_default(add_app(), TaskArgs::new().arg(&blocker));
        let (_, done) = manual.next_submission(WAIT).unwrap();

        // Resolving a kernel-owned future from outside breaks single assignment.
        a.set_result(json!("forged")).unwrap();
        done.succeed(json!(1));

        assert!(b.wait(WAIT).unwrap_err().is_cancelled());
        assert!(matches!(
            kernel.fatal_error(),
            Some(DataflowError::ProtocolViolation { task_id, .. }) if task_id == a.task_id()
        ));
        assert!(!kernel.is_accepting());
    }

    /// Sleeps on every event to widen scheduling windows
    struct SlowSink;

    impl MonitoringSink for SlowSink {
        fn emit(&self, _event: &TaskEvent) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Blocks inside the first `Submitted` event until the gate opens
    struct GatedSink {
        entered: crossbeam::channel::Sender<()>,
        gate: crossbeam::channel::Receiver<()>,
    }

    impl MonitoringSink for GatedSink {
        fn emit(&self, event: &TaskEvent) {
            if event.kind == TaskEventKind::Submitted {
                let _ = self.entered.try_send(());
                let _ = self.gate.recv_timeout(Duration::from_secs(5));
            }
        }
    }

    #[test]
    fn test_shutdown_cancels_dependents_across_scheduler_threads() {
        let manual = Arc::new(ManualExecutor::new("manual"));
        let kernel = Kernel::builder(KernelConfig::default().with_submission_threads(2))
            .executor(manual.clone())
            .monitor(Arc::new(SlowSink))
            .build()
            .unwrap();

        let upstream = kernel.submit_default(add_app(), TaskArgs::new());
        let dependents: Vec<_> = (0..50)
            .map(|i| kernel.submit_default(add_app(), TaskArgs::new().arg(&upstream).arg(i)))
            .collect();
        let (_work, held) = manual.next_submission(WAIT).unwrap();
        held.started();

        kernel.shutdown(true);
        assert!(upstream.wait(WAIT).unwrap_err().is_cancelled());
        for dependent in &dependents {
            let err = dependent.wait(WAIT).unwrap_err();
            assert!(err.is_cancelled(), "{} resolved with {err}", dependent.task_id());
        }
        assert_eq!(kernel.summary().count(TaskStatus::Cancelled), 51);
        assert_eq!(kernel.summary().count(TaskStatus::Failed), 0);
    }

    #[test]
    fn test_slow_sink_does_not_hold_the_task_lock() {
        let (entered_tx, entered_rx) = crossbeam::channel::bounded(1);
        let (gate_tx, gate_rx) = crossbeam::channel::bounded(1);
        let manual = Arc::new(ManualExecutor::new("manual"));
        let kernel = Kernel::builder(KernelConfig::default())
            .executor(manual.clone())
            .monitor(Arc::new(GatedSink {
                entered: entered_tx,
                gate: gate_rx,
            }))
            .build()
            .unwrap();

        let f = kernel.submit_default(add_app(), TaskArgs::new().arg(7));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let asked = Instant::now();
        assert_eq!(kernel.task_status(f.task_id()), Some(TaskStatus::Submitted));
        assert!(asked.elapsed() < Duration::from_secs(1));

        gate_tx.send(()).unwrap();
        let (work, done) = manual.next_submission(WAIT).unwrap();
        done.finish(work.execute());
        assert_eq!(f.wait(WAIT), Ok(json!(7)));
    }

    #[test]
    fn test_long_rejection_streak_stays_within_retry_bound() {
        let manual = Arc::new(ManualExecutor::new("manual"));
        manual.reject_next(2_000);
        let kernel = Kernel::builder(KernelConfig::default().with_retries(2_000))
            .executor(manual.clone())
            .build()
            .unwrap();

        let f = kernel.submit_default(add_app(), TaskArgs::new().arg(2));
        let (work, done) = manual.next_submission(WAIT).unwrap();
        assert_eq!(work.attempt, 2_001);
        done.finish(work.execute());
        assert_eq!(f.wait(WAIT), Ok(json!(2)));
    }

    #[test]
    fn test_stopped_schedulers_leave_work_pending() {
        let (kernel, executor, _) = inline_kernel(KernelConfig::default().with_submission_threads(3));
        let handles = std::mem::take(&mut *kernel.threads.lock());
        assert_eq!(handles.len(), 3);
        assert!(handles.iter().all(|h| {
            h.thread().name().is_some_and(|name| name.starts_with("weft-submit-"))
        }));

        kernel.shared.stop_schedulers(handles);
        let f = kernel.submit_default(add_app(), TaskArgs::new().arg(1));
        assert!(f.wait(Some(Duration::from_millis(50))).unwrap_err().is_timed_out());
        assert_eq!(executor.submitted(), 0);

        kernel.shutdown(true);
        assert!(f.wait(WAIT).unwrap_err().is_cancelled());
    }

    #[test]
    fn test_build_rejects_bad_config() {
        let err = Kernel::builder(KernelConfig::default().with_default_executor("missing"))
            .executor(Arc::new(InlineExecutor::new("local")))
            .build()
            .unwrap_err();
        assert!(matches!(err, DataflowError::Configuration(_)));
    }
}
