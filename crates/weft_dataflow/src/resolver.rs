//! Dependency discovery and argument resolution.
//!
//! Dependencies are never declared. They are found by walking a task's
//! argument tree for embedded futures, and each one gets a done-callback
//! that counts the task down toward readiness.

use crate::error::DataflowError;
use crate::future::AppFuture;
use crate::scheduler::SchedulerEvent;
use crate::task::{Arg, ResolvedArgs, TaskArgs, TaskRecord};
use crossbeam::channel::Sender;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use weft_core::{TaskId, Value, ValueMap};

/// Every future embedded in `args`, at any depth, once per producing task
#[must_use]
pub fn collect_futures(args: &TaskArgs) -> Vec<AppFuture> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for arg in args.args.iter().chain(args.kwargs.values()) {
        walk(arg, &mut seen, &mut out);
    }
    out
}

fn walk(arg: &Arg, seen: &mut HashSet<TaskId>, out: &mut Vec<AppFuture>) {
    match arg {
        Arg::Value(_) => {}
        Arg::Future(future) => {
            if seen.insert(future.task_id()) {
                out.push(future.clone());
            }
        }
        Arg::List(items) => {
            for item in items {
                walk(item, seen, out);
            }
        }
        Arg::Map(map) => {
            for item in map.values() {
                walk(item, seen, out);
            }
        }
    }
}

/// Substitute every future in `args` by its value.
///
/// # Errors
///
/// An errored future yields `UpstreamFailure`. An unresolved future means
/// the task was promoted too early and yields `ProtocolViolation`.
pub fn resolve_args(task_id: TaskId, args: &TaskArgs) -> Result<ResolvedArgs, DataflowError> {
    let positional = args
        .args
        .iter()
        .map(|arg| resolve(task_id, arg))
        .collect::<Result<Vec<_>, _>>()?;

    let mut kwargs = ValueMap::new();
    for (name, arg) in &args.kwargs {
        kwargs.insert(name.clone(), resolve(task_id, arg)?);
    }

    Ok(ResolvedArgs {
        args: positional,
        kwargs,
    })
}

fn resolve(task_id: TaskId, arg: &Arg) -> Result<Value, DataflowError> {
    match arg {
        Arg::Value(value) => Ok(value.clone()),
        Arg::Future(future) => match future.try_outcome() {
            Some(Ok(value)) => Ok(value),
            Some(Err(cause)) => Err(DataflowError::UpstreamFailure {
                task_id,
                dependency: future.task_id(),
                cause: Box::new(cause),
            }),
            None => Err(DataflowError::ProtocolViolation {
                task_id,
                reason: format!("dependency {} unresolved at dispatch", future.task_id()),
            }),
        },
        Arg::List(items) => items
            .iter()
            .map(|item| resolve(task_id, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Arg::Map(map) => {
            let mut out = ValueMap::new();
            for (key, item) in map {
                out.insert(key.clone(), resolve(task_id, item)?);
            }
            Ok(Value::Object(out))
        }
    }
}

/// Wires a record to its dependencies' futures
pub(crate) struct DependencyResolver;

impl DependencyResolver {
    /// Register done-callbacks for every dependency of `record`.
    ///
    /// The pending counter starts at `deps + 1`; the extra unit is released
    /// after all callbacks are registered, so a dependency that resolves
    /// mid-registration cannot promote the task early. Returns the number of
    /// dependencies.
    pub(crate) fn register(record: &Arc<TaskRecord>, events: &Sender<SchedulerEvent>) -> usize {
        let deps = collect_futures(&record.args);
        record.pending.store(deps.len() + 1, Ordering::SeqCst);

        for dep in &deps {
            let weak = Arc::downgrade(record);
            let events = events.clone();
            let dependency = dep.task_id();
            dep.add_done_callback(move |outcome| {
                let Some(record) = weak.upgrade() else {
                    return;
                };
                match outcome {
                    Ok(_) => release(&record, &events),
                    Err(cause) => {
                        if !record.dependency_failed.swap(true, Ordering::AcqRel) {
                            post(
                                &events,
                                SchedulerEvent::DependencyFailed {
                                    task: record.id,
                                    dependency,
                                    cause: cause.clone(),
                                },
                            );
                        }
                    }
                }
            });
        }

        release(record, events);
        deps.len()
    }
}

fn release(record: &TaskRecord, events: &Sender<SchedulerEvent>) {
    if record.pending.fetch_sub(1, Ordering::AcqRel) == 1
        && !record.dependency_failed.load(Ordering::Acquire)
    {
        post(events, SchedulerEvent::Ready(record.id));
    }
}

fn post(events: &Sender<SchedulerEvent>, event: SchedulerEvent) {
    if events.send(event).is_err() {
        tracing::trace!("scheduler stopped; dropping dependency notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::App;
    use crossbeam::channel::unbounded;
    use indexmap::IndexMap;
    use serde_json::json;

    fn record(id: u64, args: TaskArgs) -> Arc<TaskRecord> {
        let app = App::new("t", |_, _| Ok(Value::Null));
        Arc::new(TaskRecord::new(TaskId::from_raw(id), app, args, None, 0, false))
    }

    #[test]
    fn test_collect_nested_futures() {
        let a = AppFuture::new(TaskId::from_raw(1));
        let b = AppFuture::new(TaskId::from_raw(2));
        let mut inner = IndexMap::new();
        inner.insert("deep".to_string(), Arg::List(vec![Arg::from(&b), Arg::from(&a)]));
        let args = TaskArgs::new()
            .arg(1)
            .arg(&a)
            .kwarg("m", Arg::Map(inner));

        let ids: Vec<_> = collect_futures(&args).iter().map(AppFuture::task_id).collect();
        assert_eq!(ids, vec![TaskId::from_raw(1), TaskId::from_raw(2)]);
    }

    #[test]
    fn test_resolve_substitutes_values() {
        let a = AppFuture::new(TaskId::from_raw(1));
        a.set_result(json!(10)).unwrap();
        let args = TaskArgs::new()
            .arg(Arg::List(vec![Arg::from(&a), Arg::from("x")]))
            .kwarg("k", &a);

        let resolved = resolve_args(TaskId::from_raw(2), &args).unwrap();
        assert_eq!(resolved.args, vec![json!([10, "x"])]);
        assert_eq!(resolved.kwargs.get("k"), Some(&json!(10)));
    }

    #[test]
    fn test_resolve_errors() {
        let failed = AppFuture::new(TaskId::from_raw(1));
        failed
            .set_error(DataflowError::Cancelled {
                task_id: TaskId::from_raw(1),
            })
            .unwrap();
        let err = resolve_args(TaskId::from_raw(5), &TaskArgs::new().arg(&failed)).unwrap_err();
        assert!(matches!(
            err,
            DataflowError::UpstreamFailure { task_id, dependency, .. }
                if task_id == TaskId::from_raw(5) && dependency == TaskId::from_raw(1)
        ));

        let pending = AppFuture::new(TaskId::from_raw(2));
        let err = resolve_args(TaskId::from_raw(5), &TaskArgs::new().arg(&pending)).unwrap_err();
        assert!(matches!(err, DataflowError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_no_dependencies_is_ready_immediately() {
        let (tx, rx) = unbounded();
        let r = record(1, TaskArgs::new().arg(3));
        assert_eq!(DependencyResolver::register(&r, &tx), 0);
        assert!(matches!(rx.try_recv(), Ok(SchedulerEvent::Ready(id)) if id == r.id));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ready_only_after_all_dependencies() {
        let (tx, rx) = unbounded();
        let a = AppFuture::new(TaskId::from_raw(1));
        let b = AppFuture::new(TaskId::from_raw(2));
        let r = record(3, TaskArgs::new().arg(&a).arg(&b));
        assert_eq!(DependencyResolver::register(&r, &tx), 2);
        assert!(rx.try_recv().is_err());

        a.set_result(json!(1)).unwrap();
        assert!(rx.try_recv().is_err());

        b.set_result(json!(2)).unwrap();
        assert!(matches!(rx.try_recv(), Ok(SchedulerEvent::Ready(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_already_resolved_dependencies() {
        let (tx, rx) = unbounded();
        let a = AppFuture::new(TaskId::from_raw(1));
        a.set_result(json!(1)).unwrap();
        let r = record(2, TaskArgs::new().arg(&a));
        DependencyResolver::register(&r, &tx);
        assert!(matches!(rx.try_recv(), Ok(SchedulerEvent::Ready(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failure_posts_once_and_never_ready() {
        let (tx, rx) = unbounded();
        let a = AppFuture::new(TaskId::from_raw(1));
        let b = AppFuture::new(TaskId::from_raw(2));
        let c = AppFuture::new(TaskId::from_raw(3));
        let r = record(4, TaskArgs::new().arg(&a).arg(&b).arg(&c));
        DependencyResolver::register(&r, &tx);

        let cancelled = |id| DataflowError::Cancelled {
            task_id: TaskId::from_raw(id),
        };
        a.set_error(cancelled(1)).unwrap();
        b.set_error(cancelled(2)).unwrap();
        c.set_result(json!(0)).unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SchedulerEvent::DependencyFailed { dependency, .. } if *dependency == TaskId::from_raw(1)
        ));
    }

    #[test]
    fn test_concurrent_resolution_promotes_once() {
        for _ in 0..50 {
            let (tx, rx) = unbounded();
            let deps: Vec<_> = (0..8).map(|i| AppFuture::new(TaskId::from_raw(i))).collect();
            let mut args = TaskArgs::new();
            for d in &deps {
                args = args.arg(d);
            }
            let r = record(100, args);

            let handles: Vec<_> = deps
                .iter()
                .cloned()
                .map(|d| std::thread::spawn(move || d.set_result(json!(1)).unwrap()))
                .collect();
            DependencyResolver::register(&r, &tx);
            for h in handles {
                h.join().unwrap();
            }

            let ready = rx
                .try_iter()
                .filter(|e| matches!(e, SchedulerEvent::Ready(_)))
                .count();
            assert_eq!(ready, 1);
        }
    }
}
