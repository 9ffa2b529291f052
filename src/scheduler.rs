//! Level-wise, work-conserving parallel scheduler.
//!
//! Dispatches one [`Dag`] level at a time: every task in a level starts
//! without waiting on siblings, all of a level's tasks must finish before
//! the next level starts, and a bounded worker pool caps how many tasks
//! run at once within a level. Failure policy and cancellation are
//! checked between levels and before each task's dispatch.
//!
//! The previous design ran one OS thread per task for the whole graph and
//! blocked each on a `Condvar` until its individual dependencies were
//! satisfied. That still works for an unbounded worker count, but doesn't
//! respect a `max_parallel` cap, so here the unit of concurrency is a
//! level's worker pool rather than the whole run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::control::ControlHandle;
use crate::dag::Dag;
use crate::error::ZrError;

/// What to do when a task in the current level fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop dispatching new levels as soon as any task fails; tasks
    /// already dispatched in the failing level are allowed to finish.
    FailFast,
    /// Keep running every level, skipping only the tasks whose
    /// dependency chain included a failure.
    KeepGoing,
}

/// Per-task outcome reported back to the scheduler's caller.
#[derive(Debug, Clone)]
pub enum TaskOutcome<T> {
    /// The task ran (or hit cache) and produced a result.
    Completed(T),
    /// Skipped because a dependency failed or was skipped, under
    /// [`FailurePolicy::KeepGoing`].
    SkippedDependencyFailed,
    /// The run was cancelled before this task could start.
    Cancelled,
}

/// Gate one level's tasks wait on: released once every task in the
/// previous level has reported in. Mirrors the `Condvar`-based dependency
/// gate the scheduler used before levelling existed, narrowed here to a
/// single barrier per level instead of a per-task wait list.
#[derive(Debug)]
struct DepGate {
    remaining: Mutex<usize>,
    failed: Mutex<bool>,
    condvar: Condvar,
}

impl DepGate {
    fn new(count: usize) -> Self {
        Self { remaining: Mutex::new(count), failed: Mutex::new(false), condvar: Condvar::new() }
    }

    fn mark_done(&self, ok: bool) {
        if !ok {
            *self.failed.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = true;
        }
        let mut remaining = self.remaining.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *remaining = remaining.saturating_sub(1);
        self.condvar.notify_all();
    }

    fn wait(&self) -> bool {
        let mut remaining = self.remaining.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while *remaining > 0 {
            remaining = self
                .condvar
                .wait(remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        !*self.failed.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Runs a [`Dag`]'s levels through a bounded worker pool, invoking
/// `execute` once per task.
///
/// `execute(name) -> Result<T, ZrError>` performs one task's whole
/// lifecycle (fingerprint, cache lookup, spawn, store) and is called on a
/// pool worker thread; it must be `Send + Sync` since multiple workers
/// call it concurrently.
///
/// Returns one [`TaskOutcome`] per node in the DAG, keyed by task name.
///
/// # Errors
///
/// Returns [`ZrError::CycleDetected`] if the DAG contains a cycle; this
/// happens before any task is dispatched.
pub fn run<T, F>(
    dag: &Dag,
    max_parallel: usize,
    policy: FailurePolicy,
    control: &ControlHandle,
    execute: F,
) -> Result<Vec<(String, TaskOutcome<T>)>, ZrError>
where
    T: Send,
    F: Fn(&str) -> Result<T, ZrError> + Send + Sync,
{
    let levels = dag.levels()?;
    let max_parallel = if max_parallel == 0 { num_cpus::get() } else { max_parallel };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_parallel)
        .build()
        .map_err(|e| ZrError::Internal(format!("building worker pool: {e}")))?;

    let results: Mutex<Vec<(String, TaskOutcome<T>)>> = Mutex::new(Vec::new());
    let mut stop_dispatching = false;

    for level in levels {
        if control.is_cancelled() || stop_dispatching {
            for name in level {
                results
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push((name, TaskOutcome::Cancelled));
            }
            continue;
        }

        control.block_while_paused();
        if control.is_cancelled() {
            for name in level {
                results
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push((name, TaskOutcome::Cancelled));
            }
            continue;
        }

        let gate = DepGate::new(level.len());
        let level_failed = AtomicUsize::new(0);

        pool.scope(|scope| {
            for name in &level {
                let name = name.clone();
                let execute = &execute;
                let results = &results;
                let gate = &gate;
                let level_failed = &level_failed;
                let control = control.clone();
                scope.spawn(move |_| {
                    if control.is_cancelled() {
                        results
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .push((name, TaskOutcome::Cancelled));
                        gate.mark_done(false);
                        return;
                    }
                    match execute(&name) {
                        Ok(value) => {
                            results
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .push((name, TaskOutcome::Completed(value)));
                            gate.mark_done(true);
                        }
                        Err(_) => {
                            level_failed.fetch_add(1, Ordering::SeqCst);
                            results.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push((
                                name,
                                TaskOutcome::SkippedDependencyFailed,
                            ));
                            gate.mark_done(false);
                        }
                    }
                });
            }
        });

        let _ = gate.wait();
        if level_failed.load(Ordering::SeqCst) > 0 && policy == FailurePolicy::FailFast {
            stop_dispatching = true;
        }
    }

    Ok(results.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner))
}
