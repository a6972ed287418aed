//! Monitoring sink contract and stock sinks.
//!
//! The kernel emits one [`TaskEvent`] per lifecycle transition. Sinks must
//! not block for long: they are called from scheduler threads.

use crate::task::TaskStatus;
use crossbeam::channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use weft_core::{RunId, TaskId, Timestamp};

/// What happened to a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// Handed to an executor
    Submitted,
    /// Executor reported start
    Started,
    /// Finished with a value
    Completed,
    /// Finished with an error
    Failed,
    /// Failed attempt will be retried
    Retried,
    /// Cancelled
    Cancelled,
    /// Result served from a checkpoint
    CheckpointHit,
}

/// A task lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    /// Run that owns the task
    pub run_id: RunId,
    /// Task
    pub task_id: TaskId,
    /// Callable name
    pub app: String,
    /// Event kind
    pub kind: TaskEventKind,
    /// Status after the event
    pub status: TaskStatus,
    /// Executor submissions so far
    pub attempt: u32,
    /// Executor label, if routed
    pub executor: Option<String>,
    /// When it happened
    pub timestamp: Timestamp,
    /// Failure detail, if any
    pub message: Option<String>,
}

/// Receiver of task lifecycle events
pub trait MonitoringSink: Send + Sync {
    /// Record one event
    fn emit(&self, event: &TaskEvent);

    /// Push out anything buffered; called at shutdown
    fn flush(&self) {}
}

/// Call `sink.emit`, containing a panicking sink
pub(crate) fn emit_guarded(sink: &dyn MonitoringSink, event: &TaskEvent) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| sink.emit(event))) {
        tracing::warn!(
            task = %event.task_id,
            error = %crate::executor::panic_message(&*payload),
            "Monitoring sink panicked; event dropped"
        );
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MonitoringSink for NullSink {
    fn emit(&self, _event: &TaskEvent) {}
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MonitoringSink for TracingSink {
    fn emit(&self, event: &TaskEvent) {
        let message = event.message.as_deref().unwrap_or("");
        let executor = event.executor.as_deref().unwrap_or("-");
        match event.kind {
            TaskEventKind::Failed => tracing::warn!(
                run = %event.run_id,
                task = %event.task_id,
                app = %event.app,
                attempt = event.attempt,
                executor,
                detail = message,
                "task failed"
            ),
            kind => tracing::info!(
                run = %event.run_id,
                task = %event.task_id,
                app = %event.app,
                kind = ?kind,
                status = %event.status,
                attempt = event.attempt,
                executor,
                "task event"
            ),
        }
    }
}

/// Publishes events on a bounded channel, dropping when full
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<TaskEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Sink plus the receiving end, holding at most `capacity` events
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, Receiver<TaskEvent>) {
        let (tx, rx) = crossbeam::channel::bounded(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the channel was full or closed
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MonitoringSink for ChannelSink {
    fn emit(&self, event: &TaskEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingSink {
    /// Empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded
    #[must_use]
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().clone()
    }

    /// Events for one task, in emission order
    #[must_use]
    pub fn events_for(&self, task_id: TaskId) -> Vec<TaskEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Number of events of `kind`
    #[must_use]
    pub fn count(&self, kind: TaskEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl MonitoringSink for RecordingSink {
    fn emit(&self, event: &TaskEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Sends each event to several sinks
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MonitoringSink>>,
}

impl FanoutSink {
    /// No sinks yet
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn MonitoringSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of sinks
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether there are no sinks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MonitoringSink for FanoutSink {
    fn emit(&self, event: &TaskEvent) {
        // One misbehaving sink must not starve the others.
        for sink in &self.sinks {
            emit_guarded(sink.as_ref(), event);
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: TaskEventKind) -> TaskEvent {
        TaskEvent {
            run_id: RunId::new(),
            task_id: TaskId::from_raw(7),
            app: "app".to_string(),
            kind,
            status: TaskStatus::Submitted,
            attempt: 1,
            executor: Some("local".to_string()),
            timestamp: Timestamp::now(),
            message: None,
        }
    }

    struct PanickingSink;

    impl MonitoringSink for PanickingSink {
        fn emit(&self, _event: &TaskEvent) {
            panic!("sink exploded");
        }
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, rx) = ChannelSink::bounded(2);
        for _ in 0..5 {
            sink.emit(&event(TaskEventKind::Submitted));
        }
        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(sink.dropped(), 3);
    }

    #[test]
    fn test_recording_sink_filters() {
        let sink = RecordingSink::new();
        sink.emit(&event(TaskEventKind::Submitted));
        sink.emit(&event(TaskEventKind::Completed));
        assert_eq!(sink.count(TaskEventKind::Completed), 1);
        assert_eq!(sink.events_for(TaskId::from_raw(7)).len(), 2);
        assert!(sink.events_for(TaskId::from_raw(8)).is_empty());
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let recorder = Arc::new(RecordingSink::new());
        let fanout = FanoutSink::new()
            .with(Arc::new(PanickingSink))
            .with(recorder.clone());

        emit_guarded(&fanout, &event(TaskEventKind::Failed));
        emit_guarded(&PanickingSink, &event(TaskEventKind::Failed));
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn test_event_serializes() {
        let json = serde_json::to_value(event(TaskEventKind::CheckpointHit)).unwrap();
        assert_eq!(json["kind"], "checkpoint_hit");
        assert_eq!(json["status"], "submitted");
        assert_eq!(json["attempt"], 1);
    }
}
