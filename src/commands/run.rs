//! `zr run`: executes a task or workflow's dependency graph through the
//! scheduler, reconciling its per-task outcomes into one process exit code.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::cache::CacheStore;
use crate::catalog::TaskTable;
use crate::cli::{Cli, RunOpts};
use crate::control::ControlHandle;
use crate::dag::Dag;
use crate::error::ZrError;
use crate::fingerprint::Fingerprinter;
use crate::history::{HistoryStatus, HistoryStore};
use crate::logging::{BufferedLog, Log, Logger, TaskStatus};
use crate::runner::{RunOutcome, TaskRunner};
use crate::scheduler::{self, FailurePolicy, TaskOutcome};

use super::support;

/// Entry point for `zr run`: loads the catalogue, builds the task's DAG, and
/// drives it through the scheduler.
pub fn run(cli: &Cli, opts: &RunOpts) -> Result<i32, ZrError> {
    let state_root = support::state_root(cli.root.as_deref())?;
    let table = support::load_catalog(&support::catalog_path(cli.file.as_deref()))?;

    let cache = Arc::new(CacheStore::open(state_root.join("cache"))?);
    let history = Arc::new(HistoryStore::new(state_root.join("history.ndjson")));
    let fingerprinter = Arc::new(Fingerprinter::new());
    let runner = TaskRunner::new(fingerprinter, cache, history, Uuid::new_v4().to_string());

    let logger = Arc::new(Logger::new("run"));
    let control = ControlHandle::new();
    install_cancel_handler(&control);

    if let Some(profile) = &opts.profile {
        logger.debug(&format!("profile '{profile}' requested; catalogue has no profile overlays"));
    }

    let policy = if opts.keep_going { FailurePolicy::KeepGoing } else { FailurePolicy::FailFast };
    let max_parallel = support::resolve_parallel(opts.parallel);

    let code = if let Some(workflow) = table.workflow(&opts.task) {
        logger.stage(&format!("running workflow '{}'", opts.task));
        let mut overall = 0;
        for stage in &workflow.stages {
            if control.is_cancelled() {
                break;
            }
            let stage_code = run_roots(&table, stage, &runner, &control, &logger, policy, opts.no_cache, max_parallel)?;
            if stage_code != 0 {
                overall = stage_code;
                if policy == FailurePolicy::FailFast {
                    break;
                }
            }
        }
        overall
    } else {
        logger.stage(&format!("running task '{}'", opts.task));
        run_roots(&table, &[opts.task.clone()], &runner, &control, &logger, policy, opts.no_cache, max_parallel)?
    };

    control.mark_finished();
    logger.print_summary();
    Ok(code)
}

fn install_cancel_handler(control: &ControlHandle) {
    let control = control.clone();
    let _ = ctrlc::set_handler(move || control.cancel());
}

#[allow(clippy::too_many_arguments)]
fn run_roots(
    table: &TaskTable,
    roots: &[String],
    runner: &TaskRunner,
    control: &ControlHandle,
    logger: &Arc<Logger>,
    policy: FailurePolicy,
    no_cache: bool,
    max_parallel: usize,
) -> Result<i32, ZrError> {
    let dag = Dag::build(table, roots)?;
    let outcomes: Mutex<HashMap<String, RunOutcome>> = Mutex::new(HashMap::new());
    let fingerprints: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());

    let results = scheduler::run(&dag, max_parallel, policy, control, |name| {
        execute_task(name, table, runner, control, logger, policy, no_cache, &outcomes, &fingerprints)
    })?;

    for (name, outcome) in &results {
        match outcome {
            TaskOutcome::Completed(_) => {}
            TaskOutcome::SkippedDependencyFailed => logger.record_task(name, TaskStatus::Skipped, None),
            TaskOutcome::Cancelled => logger.record_task(name, TaskStatus::Cancelled, None),
        }
    }

    Ok(resolve_exit_code(&results))
}

#[allow(clippy::too_many_arguments)]
fn execute_task(
    name: &str,
    table: &TaskTable,
    runner: &TaskRunner,
    control: &ControlHandle,
    logger: &Arc<Logger>,
    policy: FailurePolicy,
    no_cache: bool,
    outcomes: &Mutex<HashMap<String, RunOutcome>>,
    fingerprints: &Mutex<HashMap<String, String>>,
) -> Result<RunOutcome, ZrError> {
    let task = table.get(name).ok_or_else(|| ZrError::UnknownTask(name.to_string()))?;

    let dep_fps = {
        let outcomes_guard = outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        for dep in &task.deps {
            let succeeded = outcomes_guard.get(dep).is_some_and(RunOutcome::success);
            if !succeeded {
                return Err(ZrError::Internal(format!(
                    "dependency '{dep}' of '{name}' did not complete successfully"
                )));
            }
        }
        let fps_guard = fingerprints.lock().unwrap_or_else(PoisonError::into_inner);
        task.deps.iter().filter_map(|d| fps_guard.get(d).cloned()).collect::<Vec<_>>()
    };
    let dep_fp_refs: Vec<&str> = dep_fps.iter().map(String::as_str).collect();

    let resolved_inputs = support::resolve_inputs(task)?;
    let run_task = if no_cache {
        let mut t = task.clone();
        t.cache = Some(false);
        t
    } else {
        task.clone()
    };

    let buffered = BufferedLog::new(Arc::clone(logger));
    logger.notify_task_start(name);
    buffered.info(&format!("running {name}: {}", task.cmd));

    let outcome = runner.run(name, &run_task, &resolved_inputs, &dep_fp_refs, control)?;

    let task_status = match outcome.status {
        HistoryStatus::Ok => TaskStatus::Ok,
        HistoryStatus::CacheHit => TaskStatus::CacheHit,
        HistoryStatus::Failed => TaskStatus::Failed,
        HistoryStatus::TimedOut => TaskStatus::TimedOut,
        HistoryStatus::Cancelled => TaskStatus::Cancelled,
    };
    let message = outcome.exit_code.filter(|_| !outcome.success()).map(|code| format!("exit {code}"));
    buffered.record_task(name, task_status, message.as_deref());
    buffered.flush_and_complete(name);

    if let Some(fp) = &outcome.fingerprint {
        fingerprints.lock().unwrap_or_else(PoisonError::into_inner).insert(name.to_string(), fp.clone());
    }
    outcomes.lock().unwrap_or_else(PoisonError::into_inner).insert(name.to_string(), outcome.clone());

    if !outcome.success() && policy == FailurePolicy::FailFast {
        control.cancel();
    }

    Ok(outcome)
}

/// Reduce a scheduler run's per-task outcomes to a single process exit
/// code, per the command surface's exit code table: a genuine child
/// failure's own exit code (or 124 for a timeout) always wins, even when a
/// `FailFast` cancellation of a sibling also shows up in `results` — the
/// vector's order is the scheduler's nondeterministic completion order, so
/// a full scan for a real failure happens before falling back to 125 (skip
/// only) or 130 (cancellation with no child failure at all).
fn resolve_exit_code(results: &[(String, TaskOutcome<RunOutcome>)]) -> i32 {
    let mut saw_skipped = false;
    let mut saw_cancelled = false;
    for (_, outcome) in results {
        match outcome {
            TaskOutcome::Completed(run) => match run.status {
                HistoryStatus::Ok | HistoryStatus::CacheHit => {}
                HistoryStatus::Failed => return run.exit_code.unwrap_or(1),
                HistoryStatus::TimedOut => return 124,
                HistoryStatus::Cancelled => saw_cancelled = true,
            },
            TaskOutcome::SkippedDependencyFailed => saw_skipped = true,
            TaskOutcome::Cancelled => saw_cancelled = true,
        }
    }
    if saw_skipped {
        125
    } else if saw_cancelled {
        130
    } else {
        0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::runner::RunOutcome;

    fn completed(status: HistoryStatus, exit_code: Option<i32>) -> TaskOutcome<RunOutcome> {
        TaskOutcome::Completed(RunOutcome {
            status,
            fingerprint: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code,
        })
    }

    #[test]
    fn all_ok_is_exit_zero() {
        let results = vec![("a".to_string(), completed(HistoryStatus::Ok, Some(0)))];
        assert_eq!(resolve_exit_code(&results), 0);
    }

    #[test]
    fn a_failed_task_reports_its_own_exit_code() {
        let results = vec![("a".to_string(), completed(HistoryStatus::Failed, Some(7)))];
        assert_eq!(resolve_exit_code(&results), 7);
    }

    #[test]
    fn timeout_reports_124() {
        let results = vec![("a".to_string(), completed(HistoryStatus::TimedOut, None))];
        assert_eq!(resolve_exit_code(&results), 124);
    }

    #[test]
    fn skip_only_reports_125() {
        let results = vec![
            ("a".to_string(), completed(HistoryStatus::Failed, Some(1))),
            ("b".to_string(), TaskOutcome::SkippedDependencyFailed),
        ];
        // "a" itself failed, so its own exit code wins over the skip.
        assert_eq!(resolve_exit_code(&results), 1);
    }

    #[test]
    fn skip_without_any_failed_task_reports_125() {
        let results = vec![("b".to_string(), TaskOutcome::SkippedDependencyFailed)];
        assert_eq!(resolve_exit_code(&results), 125);
    }

    #[test]
    fn cancellation_reports_130() {
        let results = vec![("a".to_string(), TaskOutcome::Cancelled)];
        assert_eq!(resolve_exit_code(&results), 130);
    }

    #[test]
    fn failed_task_wins_over_a_fail_fast_cancelled_sibling_regardless_of_order() {
        let cancelled_first = vec![
            ("c".to_string(), TaskOutcome::Cancelled),
            ("b".to_string(), completed(HistoryStatus::Failed, Some(3))),
        ];
        assert_eq!(resolve_exit_code(&cancelled_first), 3);

        let failed_first = vec![
            ("b".to_string(), completed(HistoryStatus::Failed, Some(3))),
            ("c".to_string(), TaskOutcome::Cancelled),
        ];
        assert_eq!(resolve_exit_code(&failed_first), 3);
    }

    #[test]
    fn timed_out_task_wins_over_a_cancelled_sibling() {
        let results = vec![
            ("c".to_string(), TaskOutcome::Cancelled),
            ("b".to_string(), completed(HistoryStatus::TimedOut, None)),
        ];
        assert_eq!(resolve_exit_code(&results), 124);
    }
}
