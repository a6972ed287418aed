//! Local thread-pool executor.
//!
//! App bodies run on tokio's blocking pool, which caps concurrency at
//! `max_threads`. A small async driver per unit applies the walltime limit
//! and reports through the unit's [`Completion`].

use crate::backlog::Backlog;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use weft_dataflow::{
    Completion, ExecFailure, Executor, ExecutorError, ShutdownMode, SubmitTicket, WorkUnit,
};

/// How long a drained pool waits for detached blocking threads
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Thread-pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Routing label
    pub label: String,
    /// Maximum app bodies running at once
    pub max_threads: usize,
    /// Per-attempt walltime in milliseconds, unlimited when `None`
    pub walltime_ms: Option<u64>,
}

impl ThreadPoolConfig {
    /// Create a config with the given label
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            max_threads: std::thread::available_parallelism().map_or(4, usize::from),
            walltime_ms: None,
        }
    }

    /// Set the thread cap
    #[must_use]
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Set the walltime
    #[must_use]
    pub fn with_walltime(mut self, walltime_ms: u64) -> Self {
        self.walltime_ms = Some(walltime_ms);
        self
    }

    /// Walltime as a duration
    #[must_use]
    pub fn walltime(&self) -> Option<Duration> {
        self.walltime_ms.map(Duration::from_millis)
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self::new("threads")
    }
}

enum PoolState {
    Idle,
    Running(Runtime),
    Stopped,
}

/// Executor running app bodies on a local thread pool
pub struct ThreadPoolExecutor {
    config: ThreadPoolConfig,
    state: Mutex<PoolState>,
    accepting: AtomicBool,
    next_ticket: AtomicU64,
    backlog: Arc<Backlog>,
}

impl ThreadPoolExecutor {
    /// Create a stopped pool
    #[must_use]
    pub fn new(config: ThreadPoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::Idle),
            accepting: AtomicBool::new(false),
            next_ticket: AtomicU64::new(1),
            backlog: Arc::new(Backlog::default()),
        }
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &ThreadPoolConfig {
        &self.config
    }

    fn shutting_down(&self) -> ExecutorError {
        ExecutorError::ShuttingDown {
            label: self.config.label.clone(),
        }
    }
}

impl std::fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("config", &self.config)
            .field("outstanding", &self.backlog.len())
            .finish_non_exhaustive()
    }
}

async fn drive(backlog: Arc<Backlog>, ticket: u64, work: WorkUnit, walltime: Option<Duration>) {
    let task_id = work.task_id;
    let (started_tx, started_rx) = oneshot::channel();
    let claim = Arc::clone(&backlog);
    let mut job = tokio::task::spawn_blocking(move || {
        if !claim.claim(ticket) {
            return None;
        }
        let _ = started_tx.send(());
        Some(work.execute())
    });

    // The walltime clock starts when a thread picks the unit up.
    if started_rx.await.is_ok() {
        if let Some(limit) = walltime {
            if tokio::time::timeout(limit, &mut job).await.is_err() {
                tracing::warn!(task = %task_id, ?limit, "Walltime exceeded");
                backlog.finish(
                    ticket,
                    Err(ExecFailure::timeout(format!("walltime of {limit:?} exceeded"))),
                );
                return;
            }
        }
    }

    match job.await {
        Ok(Some(outcome)) => {
            backlog.finish(ticket, outcome);
        }
        Ok(None) => {}
        Err(err) => {
            backlog.finish(
                ticket,
                Err(ExecFailure::worker_lost(format!("worker thread failed: {err}"))),
            );
        }
    }
}

impl Executor for ThreadPoolExecutor {
    fn label(&self) -> &str {
        &self.config.label
    }

    fn start(&self) -> Result<(), ExecutorError> {
        let mut state = self.state.lock();
        match *state {
            PoolState::Running(_) => return Ok(()),
            PoolState::Stopped => return Err(self.shutting_down()),
            PoolState::Idle => {}
        }
        if self.config.max_threads == 0 {
            return Err(ExecutorError::Startup {
                label: self.config.label.clone(),
                reason: "max_threads must be at least 1".to_string(),
            });
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(self.config.max_threads)
            .thread_name(format!("{}-worker", self.config.label))
            .enable_time()
            .build()
            .map_err(|e| ExecutorError::Startup {
                label: self.config.label.clone(),
                reason: e.to_string(),
            })?;
        *state = PoolState::Running(runtime);
        self.accepting.store(true, Ordering::Release);

        tracing::info!(
            label = %self.config.label,
            max_threads = self.config.max_threads,
            walltime_ms = ?self.config.walltime_ms,
            "Thread pool started"
        );
        Ok(())
    }

    fn submit(&self, work: WorkUnit, done: Completion) -> Result<SubmitTicket, ExecutorError> {
        let state = self.state.lock();
        let runtime = match &*state {
            PoolState::Idle => {
                return Err(ExecutorError::NotStarted {
                    label: self.config.label.clone(),
                });
            }
            PoolState::Stopped => return Err(self.shutting_down()),
            PoolState::Running(runtime) => runtime,
        };
        if !self.accepting.load(Ordering::Acquire) {
            return Err(self.shutting_down());
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.backlog.insert(ticket, done);
        tracing::trace!(task = %work.task_id, attempt = work.attempt, ticket, "Queued on thread pool");
        runtime.spawn(drive(
            Arc::clone(&self.backlog),
            ticket,
            work,
            self.config.walltime(),
        ));
        Ok(SubmitTicket(ticket))
    }

    fn cancel(&self, ticket: SubmitTicket) -> bool {
        self.backlog.withdraw(ticket.0)
    }

    fn outstanding(&self) -> usize {
        self.backlog.len()
    }

    fn shutdown(&self, mode: ShutdownMode) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            // Never started, or already stopping.
            let mut state = self.state.lock();
            if matches!(*state, PoolState::Idle) {
                *state = PoolState::Stopped;
            }
            return;
        }

        match mode {
            ShutdownMode::Drain => self.backlog.wait_drained(),
            ShutdownMode::Cancel => {
                let abandoned = self.backlog.abandon_all();
                if abandoned > 0 {
                    tracing::debug!(label = %self.config.label, abandoned, "Abandoned outstanding units");
                }
            }
        }

        let previous = std::mem::replace(&mut *self.state.lock(), PoolState::Stopped);
        if let PoolState::Running(runtime) = previous {
            match mode {
                ShutdownMode::Drain => runtime.shutdown_timeout(SHUTDOWN_GRACE),
                ShutdownMode::Cancel => runtime.shutdown_background(),
            }
        }
        tracing::info!(label = %self.config.label, ?mode, "Thread pool stopped");
    }
}
