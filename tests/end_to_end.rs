//! Cross-module scenarios exercising the public `zr` library the way the
//! CLI binary does: synthetic catalogues, real `/bin/sh -c` children, no
//! mocks. Each test stands up its own state root under a fresh `tempfile`
//! directory so runs never share a cache or history log.

#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser as _;

use zr::cache::CacheStore;
use zr::catalog::{self, TaskTable};
use zr::cli::Cli;
use zr::commands;
use zr::control::ControlHandle;
use zr::dag::Dag;
use zr::error::ZrError;
use zr::fingerprint::Fingerprinter;
use zr::history::{HistoryQuery, HistoryStatus, HistoryStore};
use zr::runner::{RunOutcome, TaskRunner};
use zr::scheduler::{self, FailurePolicy, TaskOutcome};

fn runner_in(dir: &std::path::Path) -> TaskRunner {
    TaskRunner::new(
        Arc::new(Fingerprinter::new()),
        Arc::new(CacheStore::open(dir.join("cache")).unwrap()),
        Arc::new(HistoryStore::new(dir.join("history.ndjson"))),
        "end-to-end".to_string(),
    )
}

/// Mirrors `commands::run::execute_task`'s per-task lifecycle: gate on
/// dependency success, carry dependency fingerprints forward, and cancel
/// the rest of the run on a `FailFast` failure.
#[allow(clippy::too_many_arguments)]
fn execute(
    name: &str,
    table: &TaskTable,
    runner: &TaskRunner,
    control: &ControlHandle,
    policy: FailurePolicy,
    outcomes: &Mutex<HashMap<String, RunOutcome>>,
    fingerprints: &Mutex<HashMap<String, String>>,
) -> Result<RunOutcome, ZrError> {
    let task = table.get(name).ok_or_else(|| ZrError::UnknownTask(name.to_string()))?;

    let dep_fps = {
        let guard = outcomes.lock().unwrap();
        for dep in &task.deps {
            if !guard.get(dep).is_some_and(RunOutcome::success) {
                return Err(ZrError::Internal(format!(
                    "dependency '{dep}' of '{name}' did not complete successfully"
                )));
            }
        }
        let fps = fingerprints.lock().unwrap();
        task.deps.iter().filter_map(|d| fps.get(d).cloned()).collect::<Vec<_>>()
    };
    let dep_fp_refs: Vec<&str> = dep_fps.iter().map(String::as_str).collect();

    let outcome = runner.run(name, task, &[], &dep_fp_refs, control)?;
    if let Some(fp) = &outcome.fingerprint {
        fingerprints.lock().unwrap().insert(name.to_string(), fp.clone());
    }
    outcomes.lock().unwrap().insert(name.to_string(), outcome.clone());

    if !outcome.success() && policy == FailurePolicy::FailFast {
        control.cancel();
    }

    Ok(outcome)
}

fn outcome_for<'a>(
    results: &'a [(String, TaskOutcome<RunOutcome>)],
    name: &str,
) -> &'a TaskOutcome<RunOutcome> {
    &results.iter().find(|(n, _)| n == name).unwrap().1
}

/// Diamond DAG: `d` depends on `b` and `c`, both of which depend on `a`.
/// Every task is cacheable (it declares an output). The first run must
/// execute all four commands exactly once; an unchanged second run must
/// hit the cache for every task and spawn nothing.
#[test]
fn diamond_dag_runs_each_task_once_and_is_fully_cached_on_second_run() {
    let state = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let spawn_log = work.path().join("spawns.log");

    let mut tasks = HashMap::new();
    for (name, deps) in [("a", &[][..]), ("b", &["a"][..]), ("c", &["a"][..]), ("d", &["b", "c"][..])] {
        let task = catalog::Task {
            cmd: format!("echo {name} >> {} && touch {name}.out", spawn_log.display()),
            deps: deps.iter().map(ToString::to_string).collect(),
            inputs: vec![],
            outputs: vec![format!("{name}.out")],
            env: HashMap::new(),
            cwd: Some(work.path().to_path_buf()),
            description: None,
            cache: None,
            timeout_ms: None,
            retries: 0,
        };
        tasks.insert(name.to_string(), task);
    }
    let table = TaskTable::new(tasks, HashMap::new()).unwrap();
    let dag = Dag::build(&table, &["d".to_string()]).unwrap();

    let runner = runner_in(state.path());
    let control = ControlHandle::new();
    let outcomes: Mutex<HashMap<String, RunOutcome>> = Mutex::new(HashMap::new());
    let fingerprints: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());

    let first = scheduler::run(&dag, 4, FailurePolicy::FailFast, &control, |name| {
        execute(name, &table, &runner, &control, FailurePolicy::FailFast, &outcomes, &fingerprints)
    })
    .unwrap();
    assert_eq!(first.len(), 4);
    for name in ["a", "b", "c", "d"] {
        assert!(
            matches!(outcome_for(&first, name), TaskOutcome::Completed(o) if o.success()),
            "{name} should have completed successfully on the first run"
        );
    }
    let spawned_once = std::fs::read_to_string(&spawn_log).unwrap();
    assert_eq!(spawned_once.lines().count(), 4, "each task should spawn exactly once");

    // Second run against the same cache and an unchanged graph: nothing new
    // should spawn, and every task should resolve as a cache hit.
    let outcomes: Mutex<HashMap<String, RunOutcome>> = Mutex::new(HashMap::new());
    let fingerprints: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
    let control = ControlHandle::new();
    let second = scheduler::run(&dag, 4, FailurePolicy::FailFast, &control, |name| {
        execute(name, &table, &runner, &control, FailurePolicy::FailFast, &outcomes, &fingerprints)
    })
    .unwrap();
    for name in ["a", "b", "c", "d"] {
        assert!(
            matches!(
                outcome_for(&second, name),
                TaskOutcome::Completed(o) if o.status == HistoryStatus::CacheHit
            ),
            "{name} should be served from the cache on the second run"
        );
    }
    let spawned_after_second = std::fs::read_to_string(&spawn_log).unwrap();
    assert_eq!(
        spawned_after_second.lines().count(),
        4,
        "a fully cached second run must not spawn any new processes"
    );
}

/// A cycle is rejected before any task dispatches, and the CLI-facing error
/// maps to exit code 2 with the full cycle path in its message.
#[test]
fn cycle_is_reported_with_exit_code_two_through_the_cli() {
    let state = tempfile::tempdir().unwrap();
    let catalogue = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(
        catalogue.path(),
        r#"
        [tasks.a]
        cmd = "true"
        deps = ["b"]

        [tasks.b]
        cmd = "true"
        deps = ["c"]

        [tasks.c]
        cmd = "true"
        deps = ["a"]
        "#,
    )
    .unwrap();

    let cli = Cli::try_parse_from([
        "zr",
        "--root",
        state.path().to_str().unwrap(),
        "--file",
        catalogue.path().to_str().unwrap(),
        "run",
        "a",
    ])
    .unwrap();

    let err = commands::dispatch(&cli).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(matches!(err, ZrError::CycleDetected { .. }));
    let message = err.to_string();
    assert!(message.contains("a"), "cycle message should name the involved tasks: {message}");
}

/// Under `FailFast`, a sibling still running in the same level is cancelled
/// shortly after another sibling's command fails, and the run as a whole
/// finishes quickly rather than waiting out the long sleep.
#[test]
fn fail_fast_cancels_a_sleeping_sibling_after_another_tasks_failure() {
    let state = tempfile::tempdir().unwrap();

    let mut tasks = HashMap::new();
    tasks.insert(
        "quick_failure".to_string(),
        catalog::Task {
            cmd: "exit 3".to_string(),
            deps: vec![],
            inputs: vec![],
            outputs: vec![],
            env: HashMap::new(),
            cwd: None,
            description: None,
            cache: Some(false),
            timeout_ms: None,
            retries: 0,
        },
    );
    tasks.insert(
        "slow_sibling".to_string(),
        catalog::Task {
            cmd: "sleep 5".to_string(),
            deps: vec![],
            inputs: vec![],
            outputs: vec![],
            env: HashMap::new(),
            cwd: None,
            description: None,
            cache: Some(false),
            timeout_ms: None,
            retries: 0,
        },
    );
    let table = TaskTable::new(tasks, HashMap::new()).unwrap();
    let dag = Dag::build(&table, &["quick_failure".to_string(), "slow_sibling".to_string()]).unwrap();

    let runner = runner_in(state.path());
    let control = ControlHandle::new();
    let outcomes: Mutex<HashMap<String, RunOutcome>> = Mutex::new(HashMap::new());
    let fingerprints: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());

    let start = Instant::now();
    let results = scheduler::run(&dag, 2, FailurePolicy::FailFast, &control, |name| {
        execute(name, &table, &runner, &control, FailurePolicy::FailFast, &outcomes, &fingerprints)
    })
    .unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_secs(3),
        "a FailFast sibling should be cancelled well before its 5s sleep completes, took {elapsed:?}"
    );
    assert!(
        matches!(
            outcome_for(&results, "quick_failure"),
            TaskOutcome::Completed(o) if o.status == HistoryStatus::Failed
        ),
        "the failing task should report its own exit status"
    );
    assert!(
        matches!(
            outcome_for(&results, "slow_sibling"),
            TaskOutcome::Completed(o) if !o.success()
        ),
        "the sleeping sibling should not be reported as a success"
    );
}

/// Two callers racing `TaskRunner::run` on the same fingerprint must
/// coalesce to one process spawn: whichever loses the race for the write
/// lock re-checks the cache once it gets a turn and finds the winner's
/// result waiting, instead of redundantly re-running the command.
#[test]
fn concurrent_runs_of_the_same_task_coalesce_to_one_spawn() {
    let state = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let spawn_log = work.path().join("spawns.log");

    let fingerprinter = Arc::new(Fingerprinter::new());
    let cache = Arc::new(CacheStore::open(state.path().join("cache")).unwrap());
    let history = Arc::new(HistoryStore::new(state.path().join("history.ndjson")));

    let task = catalog::Task {
        cmd: format!("echo spawned >> {} && sleep 0.3", spawn_log.display()),
        deps: vec![],
        inputs: vec![],
        outputs: vec!["out.marker".to_string()],
        env: HashMap::new(),
        cwd: Some(work.path().to_path_buf()),
        description: None,
        cache: Some(true),
        timeout_ms: None,
        retries: 0,
    };

    std::fs::write(work.path().join("out.marker"), b"placeholder").unwrap();

    let runners: Vec<TaskRunner> = (0..2)
        .map(|_| {
            TaskRunner::new(
                Arc::clone(&fingerprinter),
                Arc::clone(&cache),
                Arc::clone(&history),
                "coalesce".to_string(),
            )
        })
        .collect();

    let handles: Vec<_> = runners
        .into_iter()
        .map(|runner| {
            let task = task.clone();
            std::thread::spawn(move || runner.run("x", &task, &[], &[], &ControlHandle::new()).unwrap())
        })
        .collect();

    let outcomes: Vec<RunOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for outcome in &outcomes {
        assert!(outcome.success(), "both racing callers should see a successful outcome");
    }

    let spawns = std::fs::read_to_string(&spawn_log).unwrap();
    assert_eq!(
        spawns.lines().count(),
        1,
        "exactly one of the two concurrent invocations should have spawned the command"
    );
}

/// A task that exceeds its `timeout_ms` is reported (and recorded to
/// history) as `TimedOut`, not as a generic failure.
#[test]
fn timeout_reports_timed_out_and_persists_to_history() {
    let state = tempfile::tempdir().unwrap();
    let runner = runner_in(state.path());

    let task = catalog::Task {
        cmd: "sleep 5".to_string(),
        deps: vec![],
        inputs: vec![],
        outputs: vec![],
        env: HashMap::new(),
        cwd: None,
        description: None,
        cache: Some(false),
        timeout_ms: Some(100),
        retries: 0,
    };

    let start = Instant::now();
    let outcome = runner.run("slow", &task, &[], &[], &ControlHandle::new()).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome.status, HistoryStatus::TimedOut);
    assert!(!outcome.success());
    assert!(elapsed < Duration::from_secs(2), "a 100ms timeout should not wait out the 5s sleep");

    let history = HistoryStore::new(state.path().join("history.ndjson"));
    let records = history
        .query(&HistoryQuery { task: Some("slow".to_string()), ..HistoryQuery::default() })
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, HistoryStatus::TimedOut);
}

/// Cancelling a run's `ControlHandle` mid-flight stops a long-running task
/// and the scheduler reports it as cancelled rather than waiting for it to
/// finish naturally.
#[test]
fn cancellation_via_control_handle_is_reported_as_cancelled() {
    let state = tempfile::tempdir().unwrap();

    let mut tasks = HashMap::new();
    tasks.insert(
        "long_running".to_string(),
        catalog::Task {
            cmd: "sleep 5".to_string(),
            deps: vec![],
            inputs: vec![],
            outputs: vec![],
            env: HashMap::new(),
            cwd: None,
            description: None,
            cache: Some(false),
            timeout_ms: None,
            retries: 0,
        },
    );
    let table = TaskTable::new(tasks, HashMap::new()).unwrap();
    let dag = Dag::build(&table, &["long_running".to_string()]).unwrap();

    let runner = runner_in(state.path());
    let control = ControlHandle::new();
    let outcomes: Mutex<HashMap<String, RunOutcome>> = Mutex::new(HashMap::new());
    let fingerprints: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());

    let canceller = control.clone();
    let canceller_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        canceller.cancel();
    });

    let start = Instant::now();
    let results = scheduler::run(&dag, 1, FailurePolicy::FailFast, &control, |name| {
        execute(name, &table, &runner, &control, FailurePolicy::FailFast, &outcomes, &fingerprints)
    })
    .unwrap();
    let elapsed = start.elapsed();
    canceller_thread.join().unwrap();

    assert!(
        elapsed < Duration::from_secs(3),
        "cancellation should interrupt the 5s sleep well before it finishes, took {elapsed:?}"
    );
    assert!(
        matches!(
            outcome_for(&results, "long_running"),
            TaskOutcome::Completed(o) if o.status == HistoryStatus::Cancelled
        ),
        "the cancelled task should be recorded as Cancelled"
    );

    let history = HistoryStore::new(state.path().join("history.ndjson"));
    let records = history.query(&HistoryQuery::default()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, HistoryStatus::Cancelled);
}

/// A plain `zr run` through the public CLI surface, end to end: parses
/// args, loads a catalogue, runs the task, and persists one history record.
#[test]
fn run_command_through_the_cli_reports_zero_and_persists_history() {
    let state = tempfile::tempdir().unwrap();
    let catalogue = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(
        catalogue.path(),
        r#"
        [tasks.hello]
        cmd = "echo hello"
        "#,
    )
    .unwrap();

    let cli = Cli::try_parse_from([
        "zr",
        "--root",
        state.path().to_str().unwrap(),
        "--file",
        catalogue.path().to_str().unwrap(),
        "run",
        "hello",
    ])
    .unwrap();

    let code = commands::dispatch(&cli).unwrap();
    assert_eq!(code, 0);

    let history = HistoryStore::new(state.path().join("history.ndjson"));
    let records = history.query(&HistoryQuery::default()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task, "hello");
    assert_eq!(records[0].status, HistoryStatus::Ok);
}
