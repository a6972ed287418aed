//! Channels between the executor and its interchange.
//!
//! `None` on either pipe asks the reader to stop.

use super::messages::TaskMessage;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Executor side of the task pipe
#[derive(Debug, Clone)]
pub(crate) struct TasksOutgoing {
    tx: Sender<Option<TaskMessage>>,
}

impl TasksOutgoing {
    /// False once the interchange is gone
    pub(crate) fn put(&self, message: TaskMessage) -> bool {
        self.tx.send(Some(message)).is_ok()
    }

    pub(crate) fn request_stop(&self) {
        let _ = self.tx.send(None);
    }
}

/// Interchange side of the task pipe
#[derive(Debug)]
pub(crate) struct TasksIncoming {
    pub(crate) rx: Receiver<Option<TaskMessage>>,
}

pub(crate) fn task_pipe() -> (TasksOutgoing, TasksIncoming) {
    let (tx, rx) = channel::unbounded();
    (TasksOutgoing { tx }, TasksIncoming { rx })
}

/// Worker side of the results pipe
#[derive(Debug, Clone)]
pub(crate) struct ResultsOutgoing {
    tx: Sender<Option<Vec<u8>>>,
}

impl ResultsOutgoing {
    /// False once the reader is gone
    pub(crate) fn push(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(Some(bytes)).is_ok()
    }

    pub(crate) fn request_close(&self) {
        let _ = self.tx.send(None);
    }
}

/// Executor side of the results pipe
#[derive(Debug)]
pub(crate) struct ResultsIncoming {
    rx: Receiver<Option<Vec<u8>>>,
}

impl ResultsIncoming {
    pub(crate) fn get(&self, timeout: Duration) -> Result<Option<Vec<u8>>, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

pub(crate) fn results_pipe() -> (ResultsOutgoing, ResultsIncoming) {
    let (tx, rx) = channel::unbounded();
    (ResultsOutgoing { tx }, ResultsIncoming { rx })
}
