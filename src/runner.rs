//! Per-task execution lifecycle, in order regardless of which step ends
//! the task early: fingerprint, cache lookup, spawn (with retries and a
//! timeout), cache commit, always-written history record.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::cache::{CacheLookup, CacheManifest, CacheStore};
use crate::catalog::Task;
use crate::control::ControlHandle;
use crate::error::ZrError;
use crate::fingerprint::Fingerprinter;
use crate::history::{HistoryRecord, HistoryStatus, HistoryStore};
use crate::process::{ExitReason, ProcessController};

/// How long [`TaskRunner::run`] waits to acquire the cache write lock
/// before giving up and running the task uncached.
const CACHE_CONTENTION_MAX_WAIT: Duration = Duration::from_secs(2);

/// How often [`TaskRunner::spawn_once`] wakes up to check for an
/// out-of-band cancellation request while a child has no `timeout_ms` of
/// its own (or hasn't hit it yet).
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for the watcher thread to report in after a
/// cancellation triggered by a timeout, before treating it as vanished.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One task's outcome, as seen by the scheduler.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Final status recorded to history.
    pub status: HistoryStatus,
    /// Fingerprint computed for this run, if fingerprinting succeeded.
    pub fingerprint: Option<String>,
    /// Captured standard output (from the cache on a hit, from the child
    /// process otherwise).
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code, if the command ran to completion.
    pub exit_code: Option<i32>,
}

impl RunOutcome {
    /// Whether this outcome should be treated as a scheduler-level
    /// success (continue dependents).
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self.status, HistoryStatus::Ok | HistoryStatus::CacheHit)
    }
}

/// Executes one task: fingerprint -> cache lookup -> (cache hit | spawn
/// with retries and timeout) -> cache commit -> history append.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    fingerprinter: Arc<Fingerprinter>,
    cache: Arc<CacheStore>,
    history: Arc<HistoryStore>,
    process: ProcessController,
    run_id: String,
}

impl TaskRunner {
    /// Build a runner sharing the given cache/history/fingerprinter for
    /// one scheduler run identified by `run_id`.
    #[must_use]
    pub fn new(
        fingerprinter: Arc<Fingerprinter>,
        cache: Arc<CacheStore>,
        history: Arc<HistoryStore>,
        run_id: String,
    ) -> Self {
        Self { fingerprinter, cache, history, process: ProcessController::new(), run_id }
    }

    /// Run `task` (named `name`), consulting and updating the cache, with
    /// dependency fingerprints already resolved by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::InputMissing`] if a declared input file is
    /// missing, and propagates cache or history I/O failures. A failing
    /// command (non-zero exit, timeout) is reported through
    /// [`RunOutcome`], not as an `Err`, since it's a per-task outcome the
    /// scheduler's failure policy decides how to react to.
    pub fn run(
        &self,
        name: &str,
        task: &Task,
        resolved_inputs: &[PathBuf],
        dep_fingerprints: &[&str],
        control: &ControlHandle,
    ) -> Result<RunOutcome, ZrError> {
        let start = Instant::now();
        let env: Vec<(&str, &str)> =
            task.env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let fingerprint = self.fingerprinter.fingerprint(
            name,
            &task.cmd,
            &env,
            task.cwd.as_deref(),
            resolved_inputs,
            dep_fingerprints,
        )?;

        if task.cache_enabled() {
            if let CacheLookup::Hit(manifest) = self.cache.lookup(&fingerprint)? {
                return self.cache_hit_outcome(name, task, &fingerprint, manifest, start);
            }
        }

        let write_handle = if task.cache_enabled() {
            let handle = self.cache.begin_write(&fingerprint, CACHE_CONTENTION_MAX_WAIT)?;
            // Either we just acquired the lock after waiting out another
            // writer, or we gave up waiting for one: in both cases the
            // holder may have committed while we weren't looking, so
            // re-check before spawning a redundant process.
            if let CacheLookup::Hit(manifest) = self.cache.lookup(&fingerprint)? {
                drop(handle);
                return self.cache_hit_outcome(name, task, &fingerprint, manifest, start);
            }
            handle
        } else {
            None
        };

        let owned_env: Vec<(String, String)> =
            task.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let mut attempt = 0_u32;
        let outcome = loop {
            if control.is_cancelled() {
                break RunOutcome {
                    status: HistoryStatus::Cancelled,
                    fingerprint: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                };
            }
            let result = self.spawn_once(name, task, &owned_env, task.timeout_ms, control)?;
            let done = result.success()
                || matches!(result.status, HistoryStatus::Cancelled)
                || matches!(result.status, HistoryStatus::TimedOut)
                || attempt >= task.retries;
            if done {
                break result;
            }
            attempt += 1;
        };

        if outcome.success() {
            if let Some(handle) = write_handle {
                let manifest = CacheManifest {
                    fingerprint: fingerprint.clone(),
                    task: name.to_string(),
                    created_at: Utc::now(),
                    stdout: outcome.stdout.clone(),
                    stderr: outcome.stderr.clone(),
                    outputs: vec![],
                };
                let output_files = self.resolve_outputs(task);
                handle.commit(manifest, &output_files)?;
            }
        }

        let outcome = RunOutcome { fingerprint: Some(fingerprint), ..outcome };
        self.append_history(name, &outcome, start.elapsed())?;
        Ok(outcome)
    }

    /// Restore a cache hit's outputs and build the `RunOutcome`/history
    /// record shared by every cache-hit path (lookup before writing,
    /// lookup after losing the write race, lookup after giving up on a
    /// contended lock).
    fn cache_hit_outcome(
        &self,
        name: &str,
        task: &Task,
        fingerprint: &str,
        manifest: CacheManifest,
        start: Instant,
    ) -> Result<RunOutcome, ZrError> {
        self.restore_outputs(task, &manifest)?;
        let outcome = RunOutcome {
            status: HistoryStatus::CacheHit,
            fingerprint: Some(fingerprint.to_string()),
            stdout: manifest.stdout,
            stderr: manifest.stderr,
            exit_code: Some(0),
        };
        self.append_history(name, &outcome, start.elapsed())?;
        Ok(outcome)
    }

    fn spawn_once(
        &self,
        name: &str,
        task: &Task,
        env: &[(String, String)],
        timeout_ms: Option<u64>,
        control: &ControlHandle,
    ) -> Result<RunOutcome, ZrError> {
        let (handle, waiter) = self.process.spawn(name, &task.cmd, task.cwd.as_deref(), env)?;
        control.set_pid(handle.pid());

        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut cancelled_by_control = false;
        let (output, timed_out) = loop {
            let poll_for = deadline.map_or(CANCEL_POLL_INTERVAL, |d| {
                d.saturating_duration_since(Instant::now()).min(CANCEL_POLL_INTERVAL)
            });
            match waiter.recv_timeout(poll_for) {
                Ok(output) => break (output, false),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    control.clear_pid();
                    return Err(ZrError::Internal(format!(
                        "process watcher thread vanished for '{name}'"
                    )));
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let hit_deadline = deadline.is_some_and(|d| Instant::now() >= d);
                    if hit_deadline {
                        let _ = handle.cancel();
                        let output = waiter.recv_timeout(CANCEL_DRAIN_TIMEOUT).map_err(|_| {
                            ZrError::Internal(format!(
                                "process watcher thread vanished for '{name}'"
                            ))
                        })?;
                        break (output, true);
                    }
                    if control.is_cancelled() {
                        cancelled_by_control = true;
                        let _ = handle.cancel();
                        let output = waiter.recv_timeout(CANCEL_DRAIN_TIMEOUT).map_err(|_| {
                            ZrError::Internal(format!(
                                "process watcher thread vanished for '{name}'"
                            ))
                        })?;
                        break (output, false);
                    }
                }
            }
        };
        control.clear_pid();

        let status = if timed_out {
            HistoryStatus::TimedOut
        } else if cancelled_by_control {
            HistoryStatus::Cancelled
        } else {
            match output.reason {
                ExitReason::Exited(0) => HistoryStatus::Ok,
                ExitReason::Cancelled => HistoryStatus::Cancelled,
                ExitReason::TimedOut => HistoryStatus::TimedOut,
                ExitReason::Exited(_) | ExitReason::Signaled(_) => HistoryStatus::Failed,
            }
        };

        let exit_code = match output.reason {
            ExitReason::Exited(code) => Some(code),
            _ => None,
        };

        Ok(RunOutcome {
            status,
            fingerprint: None,
            stdout: output.stdout.to_string_lossy(),
            stderr: output.stderr.to_string_lossy(),
            exit_code,
        })
    }

    fn resolve_outputs(&self, task: &Task) -> Vec<(String, PathBuf)> {
        task.outputs
            .iter()
            .map(|rel| {
                let abs = task.cwd.as_ref().map_or_else(|| PathBuf::from(rel), |cwd| cwd.join(rel));
                (rel.clone(), abs)
            })
            .collect()
    }

    fn restore_outputs(&self, task: &Task, manifest: &CacheManifest) -> Result<(), ZrError> {
        for output in &manifest.outputs {
            let blob = self.cache.blob_path(&manifest.fingerprint, &output.sha256);
            let dest = task
                .cwd
                .as_ref()
                .map_or_else(|| PathBuf::from(&output.path), |cwd| cwd.join(&output.path));
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ZrError::CacheIoError(format!("creating {}: {e}", parent.display())))?;
            }
            std::fs::copy(&blob, &dest).map_err(|e| {
                ZrError::CacheIoError(format!("restoring {} from {}: {e}", dest.display(), blob.display()))
            })?;
        }
        Ok(())
    }

    fn append_history(
        &self,
        name: &str,
        outcome: &RunOutcome,
        duration: Duration,
    ) -> Result<(), ZrError> {
        self.history.append(&HistoryRecord {
            run_id: self.run_id.clone(),
            task: name.to_string(),
            ts: Utc::now(),
            status: outcome.status,
            duration_ns: u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
            fingerprint: outcome.fingerprint.clone(),
            exit_code: outcome.exit_code,
        })
    }
}
