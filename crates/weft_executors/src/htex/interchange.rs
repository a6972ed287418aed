//! Matches pending tasks with workers that asked for work.

use super::messages::TaskMessage;
use super::pipes::TasksIncoming;
use crate::backlog::Backlog;
use crossbeam::channel::{Receiver, Sender, select};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use weft_dataflow::ExecFailure;

enum Step {
    Task(Option<TaskMessage>),
    Request(Option<usize>),
    Idle,
}

pub(crate) struct Interchange {
    pub(crate) tasks: TasksIncoming,
    pub(crate) requests: Receiver<usize>,
    pub(crate) workers: Vec<Sender<Option<TaskMessage>>>,
    pub(crate) backlog: Arc<Backlog>,
    pub(crate) kill: Arc<AtomicBool>,
    pub(crate) max_queue_size: usize,
    pub(crate) poll_period: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: u64,
    withdrawn: u64,
}

impl Interchange {
    /// Run until stopped, then tell every worker to exit
    pub(crate) fn run(self) {
        let mut pending: VecDeque<TaskMessage> = VecDeque::new();
        let mut ready: VecDeque<usize> = VecDeque::new();
        let mut counters = Counters::default();

        loop {
            self.dispatch(&mut pending, &mut ready, &mut counters);
            if self.kill.load(Ordering::Acquire) {
                break;
            }

            // A full queue stops reading the task pipe until a worker frees up.
            let step = if pending.len() < self.max_queue_size {
                select! {
                    recv(self.tasks.rx) -> msg => Step::Task(msg.ok().flatten()),
                    recv(self.requests) -> worker => Step::Request(worker.ok()),
                    default(self.poll_period) => Step::Idle,
                }
            } else {
                select! {
                    recv(self.requests) -> worker => Step::Request(worker.ok()),
                    default(self.poll_period) => Step::Idle,
                }
            };

            match step {
                Step::Task(Some(message)) => pending.push_back(message),
                Step::Request(Some(worker)) => ready.push_back(worker),
                Step::Task(None) | Step::Request(None) => break,
                Step::Idle => {}
            }
        }

        for worker in &self.workers {
            let _ = worker.send(None);
        }
        tracing::debug!(
            dispatched = counters.dispatched,
            withdrawn = counters.withdrawn,
            dropped = pending.len(),
            "Interchange stopped"
        );
    }

    fn dispatch(
        &self,
        pending: &mut VecDeque<TaskMessage>,
        ready: &mut VecDeque<usize>,
        counters: &mut Counters,
    ) {
        while let Some(&worker) = ready.front() {
            let Some(message) = pending.pop_front() else {
                break;
            };
            if !self.backlog.claim(message.task_id) {
                counters.withdrawn += 1;
                continue;
            }
            ready.pop_front();

            let task_id = message.task_id;
            let sent = self
                .workers
                .get(worker)
                .is_some_and(|inbox| inbox.send(Some(message)).is_ok());
            if sent {
                counters.dispatched += 1;
            } else {
                tracing::warn!(worker, task_id, "Worker gone before dispatch");
                self.backlog.finish(
                    task_id,
                    Err(ExecFailure::worker_lost(format!("worker {worker} exited"))),
                );
            }
        }
    }
}
