//! Fan-out/fan-in demonstration workflow.
//!
//! `tasks` squares are spread round-robin over the configured executors and
//! summed by one fan-in task on the default executor.

use crate::config::WeftConfig;
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use weft_core::{CheckpointStore, Value, ValueMap};
use weft_dataflow::{
    App, AppError, Kernel, MonitoringSink, RunSummary, SubmitOptions, TaskArgs,
};
use weft_storage::RedbCheckpointStore;

/// Demo parameters
#[derive(Debug, Clone, Copy)]
pub struct DemoOptions {
    /// Squares to compute
    pub tasks: usize,
    /// Fail the first attempt of every k-th square; 0 disables
    pub fail_every: u64,
}

/// What a demo run produced
#[derive(Debug)]
pub struct DemoReport {
    /// Sum of squares
    pub total: i64,
    /// Expected sum
    pub expected: i64,
    /// Final task counts
    pub summary: RunSummary,
}

/// Build a kernel from `config`, reporting to `sink`
pub fn build_kernel(config: &WeftConfig, sink: Arc<dyn MonitoringSink>) -> Result<Kernel> {
    let mut builder = Kernel::builder(config.kernel.clone()).monitor(sink);
    for executor in &config.executors {
        builder = builder.executor(executor.build());
    }
    if let Some(path) = &config.checkpoint_db {
        let store: Arc<dyn CheckpointStore> = Arc::new(RedbCheckpointStore::open(path)?);
        builder = builder.checkpoint_store(store);
    }
    Ok(builder.build()?)
}

fn square(fail_every: u64) -> App {
    let failed_once = Arc::new(Mutex::new(HashSet::new()));
    App::new("square", move |args: &[Value], _: &ValueMap| {
        let n = args
            .first()
            .and_then(Value::as_i64)
            .ok_or("square expects an integer")?;
        if fail_every > 0 && n.unsigned_abs() % fail_every == 0 && failed_once.lock().insert(n) {
            return Err(AppError::new(format!("injected failure for {n}")));
        }
        Ok(json!(n * n))
    })
}

fn sum() -> App {
    App::new("sum", |args: &[Value], _: &ValueMap| {
        let mut total = 0_i64;
        for arg in args {
            let n = arg.as_i64().ok_or("sum expects integers")?;
            total = total
                .checked_add(n)
                .ok_or_else(|| AppError::new("sum overflowed"))?;
        }
        Ok(json!(total))
    })
}

/// Submit the workflow, wait for the fan-in and shut the kernel down
pub fn run(kernel: &Kernel, labels: &[String], options: DemoOptions) -> Result<DemoReport> {
    if labels.is_empty() {
        bail!("no executors configured");
    }
    let count = i64::try_from(options.tasks)?;
    let square = square(options.fail_every);
    let retries = kernel.config().retries.max(1);

    let mut fan_in = TaskArgs::new();
    for (n, label) in (0..count).zip(labels.iter().cycle()) {
        let future = kernel.submit(
            square.clone(),
            TaskArgs::new().arg(n),
            SubmitOptions::new()
                .executor(label.as_str())
                .max_retries(retries)
                .checkpoint(true),
        );
        fan_in = fan_in.arg(future);
    }
    let total = kernel.submit_default(sum(), fan_in);
    tracing::info!(tasks = options.tasks, task = %total.task_id(), "Workflow submitted");

    let outcome = total.result();
    kernel.shutdown(false);
    let value = outcome?;
    let total = value
        .as_i64()
        .ok_or_else(|| eyre!("fan-in returned {value}, not an integer"))?;

    Ok(DemoReport {
        total,
        expected: (0..count).map(|n| n * n).sum(),
        summary: kernel.summary(),
    })
}
