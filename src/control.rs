//! Cross-thread control plane for a single run: lets a UI layer (or the
//! `ctrlc` SIGINT handler installed by `main`) request cancellation, pause
//! or resume of an in-flight scheduler run without owning it.
//!
//! Uses the same `AtomicBool`/`Condvar` pairing `scheduler::DepGate` uses
//! for dependency readiness, applied here to a run-wide latch set instead
//! of a per-task one.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Sentinel stored in [`Inner::pid`] when no process is currently attached.
const NO_PID: u32 = 0;

/// Shared control state for one scheduler run.
///
/// Cloning a [`ControlHandle`] is cheap and shares the same underlying
/// flags; every clone observes the same cancel/pause/finished state.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    paused: AtomicBool,
    finished: AtomicBool,
    pid: AtomicU32,
    resume_wait: Mutex<()>,
    resume_cond: Condvar,
}

impl ControlHandle {
    /// Create a fresh, unlatched control handle for a new run.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                pid: AtomicU32::new(NO_PID),
                resume_wait: Mutex::new(()),
                resume_cond: Condvar::new(),
            }),
        }
    }

    /// Request cancellation. Monotonic: once set, never clears.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // wake anything parked in `block_while_paused` so it can observe
        // cancellation instead of waiting out a pause indefinitely.
        let _guard = self.inner.resume_wait.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.inner.resume_cond.notify_all();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Request that dispatch of new work pause. Already-running processes
    /// are paused by the caller (the scheduler) reacting to
    /// [`Self::is_paused`].
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    /// Resume dispatch after a pause, waking any thread parked in
    /// [`Self::block_while_paused`].
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        let _guard = self.inner.resume_wait.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.inner.resume_cond.notify_all();
    }

    /// Whether the run is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Block the calling thread until the run is resumed or cancelled.
    /// Returns immediately if the run isn't paused.
    pub fn block_while_paused(&self) {
        let mut guard = self.inner.resume_wait.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while self.is_paused() && !self.is_cancelled() {
            guard = self
                .inner
                .resume_cond
                .wait(guard)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Mark the run as finished. Observers polling [`Self::is_finished`]
    /// (e.g. a detached progress-reporting thread) use this to stop.
    pub fn mark_finished(&self) {
        self.inner.finished.store(true, Ordering::SeqCst);
    }

    /// Whether the run has finished (successfully, by failure, or by
    /// cancellation).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    /// Record the OS process ID of the task currently attached to this
    /// handle, so observers (a progress UI, a `cache`/`history` viewer)
    /// can report it alongside cancel/pause state.
    pub fn set_pid(&self, pid: u32) {
        self.inner.pid.store(pid, Ordering::SeqCst);
    }

    /// Clear the recorded PID once its process has exited.
    pub fn clear_pid(&self) {
        self.inner.pid.store(NO_PID, Ordering::SeqCst);
    }

    /// The OS process ID currently attached to this handle, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::SeqCst) {
            NO_PID => None,
            pid => Some(pid),
        }
    }
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}
