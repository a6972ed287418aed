//! Messages exchanged between the executor, the interchange and workers.
//!
//! Arguments cross the interchange as a packed JSON buffer. Results come
//! back as a JSON object carrying `task_id` and exactly one of `result` or
//! `exception`.

use serde::{Deserialize, Serialize};
use serde_json::json;
use weft_core::{Value, ValueMap};
use weft_dataflow::{App, ExecFailure};

/// Decoding error for interchange traffic
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Not a message this executor understands
    #[error("BadMessage: {0}")]
    BadMessage(String),

    /// The message names a task but its payload is unreadable
    #[error("DeserializationError for task {task_id}: {reason}")]
    Deserialization {
        /// Task the payload belongs to
        task_id: u64,
        /// Decoder error
        reason: String,
    },
}

/// Resolved arguments of one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedCall {
    /// Positional values
    pub args: Vec<Value>,
    /// Keyword values
    #[serde(default)]
    pub kwargs: ValueMap,
}

impl PackedCall {
    /// Pack arguments into a buffer
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be encoded
    pub fn pack(args: &[Value], kwargs: &ValueMap) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&json!({ "args": args, "kwargs": kwargs }))
    }

    /// Unpack a buffer produced by [`PackedCall::pack`]
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is not a packed call
    pub fn unpack(buffer: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(buffer)
    }
}

/// A task on its way to a worker
#[derive(Debug, Clone)]
pub struct TaskMessage {
    /// Executor-local task number
    pub task_id: u64,
    /// Callable
    pub app: App,
    /// Packed arguments
    pub buffer: Vec<u8>,
}

/// A worker's reply
#[derive(Debug, Clone, PartialEq)]
pub struct ResultMessage {
    /// Executor-local task number
    pub task_id: u64,
    /// Result or failure
    pub outcome: Result<Value, ExecFailure>,
}

impl ResultMessage {
    /// Encode for the results pipe
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body = match &self.outcome {
            Ok(value) => json!({ "task_id": self.task_id, "result": value }),
            Err(failure) => json!({ "task_id": self.task_id, "exception": failure }),
        };
        body.to_string().into_bytes()
    }

    /// Decode a message from the results pipe
    ///
    /// # Errors
    ///
    /// `BadMessage` when the message lacks a task id or a payload,
    /// `Deserialization` when the exception payload cannot be read
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let body: Value = serde_json::from_slice(bytes)
            .map_err(|e| MessageError::BadMessage(format!("not JSON: {e}")))?;
        let obj = body
            .as_object()
            .ok_or_else(|| MessageError::BadMessage("not an object".to_string()))?;
        let task_id = obj
            .get("task_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| MessageError::BadMessage("missing task_id".to_string()))?;

        if let Some(value) = obj.get("result") {
            return Ok(Self {
                task_id,
                outcome: Ok(value.clone()),
            });
        }
        match obj.get("exception") {
            Some(raw) => {
                let failure: ExecFailure = serde_json::from_value(raw.clone()).map_err(|e| {
                    MessageError::Deserialization {
                        task_id,
                        reason: e.to_string(),
                    }
                })?;
                Ok(Self {
                    task_id,
                    outcome: Err(failure),
                })
            }
            None => Err(MessageError::BadMessage(format!(
                "task {task_id}: neither result nor exception"
            ))),
        }
    }
}
