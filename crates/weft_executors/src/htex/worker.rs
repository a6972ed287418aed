//! Worker loop: ask for a task, run it, push the result.

use super::messages::{PackedCall, ResultMessage, TaskMessage};
use super::pipes::ResultsOutgoing;
use crossbeam::channel::{Receiver, Sender};
use weft_dataflow::{ExecFailure, run_app};

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) requests: Sender<usize>,
    pub(crate) inbox: Receiver<Option<TaskMessage>>,
    pub(crate) results: ResultsOutgoing,
}

impl Worker {
    pub(crate) fn run(self) {
        let mut executed = 0_u64;
        loop {
            if self.requests.send(self.id).is_err() {
                break;
            }
            let message = match self.inbox.recv() {
                Ok(Some(message)) => message,
                Ok(None) | Err(_) => break,
            };
            let reply = execute(&message);
            executed += 1;
            if !self.results.push(reply.encode()) {
                break;
            }
        }
        tracing::debug!(worker = self.id, executed, "Worker exiting");
    }
}

/// Unpack and run one task
pub(crate) fn execute(message: &TaskMessage) -> ResultMessage {
    let outcome = match PackedCall::unpack(&message.buffer) {
        Ok(call) => run_app(&message.app, &call.args, &call.kwargs),
        Err(e) => Err(ExecFailure::exception(format!("DeserializationError: {e}"))),
    };
    ResultMessage {
        task_id: message.task_id,
        outcome,
    }
}
