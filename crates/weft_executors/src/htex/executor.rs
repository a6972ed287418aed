//! The high-throughput executor and its queue-management thread.

use super::interchange::Interchange;
use super::messages::{MessageError, PackedCall, ResultMessage, TaskMessage};
use super::pipes::{ResultsIncoming, ResultsOutgoing, TasksOutgoing, results_pipe, task_pipe};
use super::worker::Worker;
use crate::backlog::Backlog;
use crossbeam::channel::{RecvTimeoutError, unbounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use weft_dataflow::{
    Completion, ExecFailure, Executor, ExecutorError, ShutdownMode, SubmitTicket, WorkUnit,
};

/// High-throughput executor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HtexConfig {
    /// Routing label
    pub label: String,
    /// Worker threads
    pub workers: usize,
    /// Tasks the interchange holds before it stops reading; 0 means one per worker
    pub max_queue_size: usize,
    /// How often idle loops check for shutdown
    pub poll_period_ms: u64,
}

impl HtexConfig {
    /// Create a config with the given label
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            workers: std::thread::available_parallelism().map_or(4, usize::from),
            max_queue_size: 0,
            poll_period_ms: 10,
        }
    }

    /// Set the worker count
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the interchange queue bound
    #[must_use]
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set the poll period
    #[must_use]
    pub fn with_poll_period(mut self, poll_period_ms: u64) -> Self {
        self.poll_period_ms = poll_period_ms;
        self
    }

    /// Queue bound after applying the per-worker default
    #[must_use]
    pub fn effective_queue_size(&self) -> usize {
        if self.max_queue_size == 0 {
            self.workers.max(1)
        } else {
            self.max_queue_size
        }
    }

    /// Poll period as a duration
    #[must_use]
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms.max(1))
    }
}

impl Default for HtexConfig {
    fn default() -> Self {
        Self::new("htex")
    }
}

struct Plumbing {
    outgoing: TasksOutgoing,
    results_close: ResultsOutgoing,
    kill: Arc<AtomicBool>,
    interchange: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    queue_management: JoinHandle<()>,
}

enum HtexState {
    Idle,
    Running(Plumbing),
    Stopped,
}

/// Executor that feeds worker threads through an interchange.
///
/// Submissions travel as packed buffers over the task pipe. The interchange
/// holds up to `max_queue_size` of them and hands each to a worker that
/// asked for work. Workers push encoded replies onto the results pipe, where
/// the queue-management thread matches them to their completion tokens.
pub struct HighThroughputExecutor {
    config: HtexConfig,
    state: Mutex<HtexState>,
    accepting: AtomicBool,
    next_task: AtomicU64,
    backlog: Arc<Backlog>,
    bad_messages: Arc<AtomicU64>,
}

impl HighThroughputExecutor {
    /// Create a stopped executor
    #[must_use]
    pub fn new(config: HtexConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HtexState::Idle),
            accepting: AtomicBool::new(false),
            next_task: AtomicU64::new(1),
            backlog: Arc::new(Backlog::default()),
            bad_messages: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &HtexConfig {
        &self.config
    }

    /// Replies the queue-management thread could not match to a task
    #[must_use]
    pub fn bad_messages(&self) -> u64 {
        self.bad_messages.load(Ordering::Relaxed)
    }

    fn startup_error(&self, reason: impl Into<String>) -> ExecutorError {
        ExecutorError::Startup {
            label: self.config.label.clone(),
            reason: reason.into(),
        }
    }

    fn spawn<F>(&self, role: &str, body: F) -> Result<JoinHandle<()>, ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        std::thread::Builder::new()
            .name(format!("{}-{role}", self.config.label))
            .spawn(body)
            .map_err(|e| self.startup_error(format!("cannot spawn {role} thread: {e}")))
    }

    fn build(&self) -> Result<Plumbing, ExecutorError> {
        if self.config.workers == 0 {
            return Err(self.startup_error("workers must be at least 1"));
        }
        let (outgoing, incoming) = task_pipe();
        let (results_out, results_in) = results_pipe();
        let (requests_tx, requests_rx) = unbounded();
        let kill = Arc::new(AtomicBool::new(false));

        // Threads spawned before a failure exit once these channels drop.
        let queue_management = {
            let backlog = Arc::clone(&self.backlog);
            let bad = Arc::clone(&self.bad_messages);
            let label = self.config.label.clone();
            let poll = self.config.poll_period();
            self.spawn("queue-management", move || {
                manage_results(&label, &results_in, &backlog, &bad, poll);
            })?
        };

        let mut inboxes = Vec::with_capacity(self.config.workers);
        let mut workers = Vec::with_capacity(self.config.workers);
        for id in 0..self.config.workers {
            let (inbox_tx, inbox_rx) = unbounded();
            inboxes.push(inbox_tx);
            let worker = Worker {
                id,
                requests: requests_tx.clone(),
                inbox: inbox_rx,
                results: results_out.clone(),
            };
            workers.push(self.spawn(&format!("worker-{id}"), move || worker.run())?);
        }
        drop(requests_tx);

        let interchange = Interchange {
            tasks: incoming,
            requests: requests_rx,
            workers: inboxes,
            backlog: Arc::clone(&self.backlog),
            kill: Arc::clone(&kill),
            max_queue_size: self.config.effective_queue_size(),
            poll_period: self.config.poll_period(),
        };
        let interchange = self.spawn("interchange", move || interchange.run())?;

        Ok(Plumbing {
            outgoing,
            results_close: results_out,
            kill,
            interchange,
            workers,
            queue_management,
        })
    }

    /// Join workers that exit within a few poll periods; detach the rest.
    ///
    /// A detached worker finishes its current app body, fails to push the
    /// reply and exits.
    fn release_workers(&self, workers: Vec<JoinHandle<()>>) {
        let deadline = Instant::now() + self.config.poll_period() * 5;
        let mut detached = 0_usize;
        for worker in workers {
            while !worker.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            if worker.is_finished() {
                self.join("worker", worker);
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            tracing::warn!(label = %self.config.label, detached, "Detached workers still running an app");
        }
    }

    fn join(&self, role: &str, handle: JoinHandle<()>) {
        if handle.join().is_err() {
            tracing::warn!(label = %self.config.label, role, "Thread panicked during shutdown");
        }
    }
}

impl std::fmt::Debug for HighThroughputExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HighThroughputExecutor")
            .field("config", &self.config)
            .field("outstanding", &self.backlog.len())
            .field("bad_messages", &self.bad_messages())
            .finish_non_exhaustive()
    }
}

/// Route replies to completion tokens until `None` arrives on the pipe
fn manage_results(
    label: &str,
    results: &ResultsIncoming,
    backlog: &Backlog,
    bad_messages: &AtomicU64,
    poll_period: Duration,
) {
    let mut routed = 0_u64;
    loop {
        let bytes = match results.get(poll_period) {
            Ok(Some(bytes)) => bytes,
            Ok(None) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => continue,
        };

        match ResultMessage::decode(&bytes) {
            Ok(reply) => {
                if backlog.finish(reply.task_id, reply.outcome) {
                    routed += 1;
                } else {
                    bad_messages.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(label, task_id = reply.task_id, "BadMessage: unknown task id");
                }
            }
            Err(MessageError::Deserialization { task_id, reason }) => {
                tracing::warn!(label, task_id, %reason, "Undecodable exception payload");
                let failure = ExecFailure::exception(format!("DeserializationError: {reason}"));
                if backlog.finish(task_id, Err(failure)) {
                    routed += 1;
                } else {
                    bad_messages.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err @ MessageError::BadMessage(_)) => {
                bad_messages.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(label, error = %err, "Dropping reply");
            }
        }
    }
    tracing::debug!(label, routed, "Queue management stopped");
}

impl Executor for HighThroughputExecutor {
    fn label(&self) -> &str {
        &self.config.label
    }

    fn start(&self) -> Result<(), ExecutorError> {
        let mut state = self.state.lock();
        match *state {
            HtexState::Running(_) => return Ok(()),
            HtexState::Stopped => {
                return Err(ExecutorError::ShuttingDown {
                    label: self.config.label.clone(),
                });
            }
            HtexState::Idle => {}
        }

        *state = HtexState::Running(self.build()?);
        self.accepting.store(true, Ordering::Release);
        tracing::info!(
            label = %self.config.label,
            workers = self.config.workers,
            max_queue_size = self.config.effective_queue_size(),
            "High-throughput executor started"
        );
        Ok(())
    }

    fn submit(&self, work: WorkUnit, done: Completion) -> Result<SubmitTicket, ExecutorError> {
        let state = self.state.lock();
        let plumbing = match &*state {
            HtexState::Idle => {
                return Err(ExecutorError::NotStarted {
                    label: self.config.label.clone(),
                });
            }
            HtexState::Stopped => {
                return Err(ExecutorError::ShuttingDown {
                    label: self.config.label.clone(),
                });
            }
            HtexState::Running(plumbing) => plumbing,
        };
        if !self.accepting.load(Ordering::Acquire) {
            return Err(ExecutorError::ShuttingDown {
                label: self.config.label.clone(),
            });
        }

        let buffer =
            PackedCall::pack(&work.args, &work.kwargs).map_err(|e| ExecutorError::Rejected {
                label: self.config.label.clone(),
                reason: format!("cannot pack arguments: {e}"),
            })?;

        let task_id = self.next_task.fetch_add(1, Ordering::Relaxed);
        self.backlog.insert(task_id, done);
        let message = TaskMessage {
            task_id,
            app: work.app,
            buffer,
        };
        if !plumbing.outgoing.put(message) {
            self.backlog.discard(task_id);
            return Err(ExecutorError::ShuttingDown {
                label: self.config.label.clone(),
            });
        }
        tracing::trace!(task = %work.task_id, attempt = work.attempt, htex_task = task_id, "Queued on interchange");
        Ok(SubmitTicket(task_id))
    }

    fn cancel(&self, ticket: SubmitTicket) -> bool {
        self.backlog.withdraw(ticket.0)
    }

    fn outstanding(&self) -> usize {
        self.backlog.len()
    }

    fn shutdown(&self, mode: ShutdownMode) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            let mut state = self.state.lock();
            if matches!(*state, HtexState::Idle) {
                *state = HtexState::Stopped;
            }
            return;
        }

        match mode {
            ShutdownMode::Drain => self.backlog.wait_drained(),
            ShutdownMode::Cancel => {
                let abandoned = self.backlog.abandon_all();
                if abandoned > 0 {
                    tracing::debug!(label = %self.config.label, abandoned, "Abandoned outstanding tasks");
                }
            }
        }

        let previous = std::mem::replace(&mut *self.state.lock(), HtexState::Stopped);
        let HtexState::Running(plumbing) = previous else {
            return;
        };
        plumbing.kill.store(true, Ordering::Release);
        plumbing.outgoing.request_stop();
        self.join("interchange", plumbing.interchange);
        match mode {
            ShutdownMode::Drain => {
                for worker in plumbing.workers {
                    self.join("worker", worker);
                }
            }
            ShutdownMode::Cancel => self.release_workers(plumbing.workers),
        }
        plumbing.results_close.request_close();
        self.join("queue-management", plumbing.queue_management);

        tracing::info!(
            label = %self.config.label,
            ?mode,
            bad_messages = self.bad_messages(),
            "High-throughput executor stopped"
        );
    }
}
