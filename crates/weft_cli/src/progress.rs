//! Progress bar driven by task events.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use weft_dataflow::{MonitoringSink, TaskEvent, TaskEventKind};

/// Advances a bar each time a task settles
pub struct ProgressSink {
    bar: ProgressBar,
    failed: AtomicU64,
    retried: AtomicU64,
    reused: AtomicU64,
}

impl ProgressSink {
    /// Bar over `total` tasks; hidden when `visible` is false
    pub fn new(total: u64, visible: bool) -> Result<Self, indicatif::style::TemplateError> {
        let bar = ProgressBar::new(total);
        if !visible {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("=> "),
        );
        Ok(Self {
            bar,
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        })
    }

    /// Tasks settled so far
    pub fn settled(&self) -> u64 {
        self.bar.position()
    }

    /// Tasks that ended failed or cancelled
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Retry decisions seen
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// Results served from checkpoints
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}

impl MonitoringSink for ProgressSink {
    fn emit(&self, event: &TaskEvent) {
        match event.kind {
            TaskEventKind::Completed => self.bar.inc(1),
            TaskEventKind::CheckpointHit => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                self.bar.inc(1);
            }
            TaskEventKind::Failed | TaskEventKind::Cancelled => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.bar.inc(1);
            }
            TaskEventKind::Retried => {
                self.retried.fetch_add(1, Ordering::Relaxed);
                self.bar
                    .set_message(format!("retrying {} ({})", event.app, event.task_id));
            }
            TaskEventKind::Submitted | TaskEventKind::Started => {}
        }
    }

    fn flush(&self) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{RunId, TaskId, Timestamp};
    use weft_dataflow::TaskStatus;

    fn event(kind: TaskEventKind, status: TaskStatus) -> TaskEvent {
        TaskEvent {
            run_id: RunId::new(),
            task_id: TaskId::from_raw(1),
            app: "square".to_string(),
            kind,
            status,
            attempt: 1,
            executor: Some("htex".to_string()),
            timestamp: Timestamp::now(),
            message: None,
        }
    }

    #[test]
    fn test_counts_terminal_events() {
        let sink = ProgressSink::new(4, false).unwrap();
        sink.emit(&event(TaskEventKind::Submitted, TaskStatus::Submitted));
        sink.emit(&event(TaskEventKind::Retried, TaskStatus::Ready));
        sink.emit(&event(TaskEventKind::Completed, TaskStatus::Completed));
        sink.emit(&event(TaskEventKind::CheckpointHit, TaskStatus::Completed));
        sink.emit(&event(TaskEventKind::Failed, TaskStatus::Failed));

        assert_eq!(sink.settled(), 3);
        assert_eq!((sink.failed(), sink.retried(), sink.reused()), (1, 1, 1));
    }
}
