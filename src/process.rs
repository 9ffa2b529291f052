//! Process control: spawns a task's command, captures its output into a
//! bounded ring buffer, and exposes cancel/pause/resume over the whole
//! process tree the command started.
//!
//! Wraps [`std::process::Command`] so a long-running child can be acted
//! on (cancelled, paused, resumed) from another thread while a scheduler
//! thread is still blocked waiting for it to exit.

use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::ZrError;

/// Default capacity of a single captured stream's ring buffer.
pub const DEFAULT_CAPTURE_LIMIT: usize = 1024 * 1024;

/// Grace period between SIGTERM and a forceful SIGKILL on cancel.
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_millis(250);

/// A byte buffer that keeps only the most recently written
/// `capacity` bytes, flagging when older bytes have been dropped.
#[derive(Debug, Default)]
struct RingBuffer {
    capacity: usize,
    data: VecDeque<u8>,
    truncated: bool,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self { capacity, data: VecDeque::with_capacity(capacity.min(64 * 1024)), truncated: false }
    }

    fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            self.data.clear();
            self.data.extend(chunk.iter().rev().take(self.capacity).rev().copied());
            self.truncated = true;
            return;
        }
        let overflow = (self.data.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.truncated = true;
            for _ in 0..overflow.min(self.data.len()) {
                self.data.pop_front();
            }
        }
        self.data.extend(chunk);
    }

    fn into_captured(self) -> CapturedStream {
        CapturedStream {
            bytes: self.data.into_iter().collect(),
            truncated: self.truncated,
        }
    }
}

/// Final captured contents of one output stream.
#[derive(Debug, Clone, Default)]
pub struct CapturedStream {
    /// Captured bytes, trimmed to at most the configured capacity.
    pub bytes: Vec<u8>,
    /// Set when output exceeded the capacity and earlier bytes were
    /// dropped to make room for newer ones.
    pub truncated: bool,
}

impl CapturedStream {
    /// Lossily decode the captured bytes as UTF-8 for display purposes.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// How a finished process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exited normally with the given status code.
    Exited(i32),
    /// Terminated by a signal (Unix only; carries the signal number).
    Signaled(i32),
    /// Killed in response to [`ProcessHandle::cancel`].
    Cancelled,
    /// Killed after exceeding its configured timeout.
    TimedOut,
}

/// Outcome of a completed child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// How the process ended.
    pub reason: ExitReason,
    /// Captured standard output.
    pub stdout: CapturedStream,
    /// Captured standard error.
    pub stderr: CapturedStream,
    /// Wall-clock time the process ran for.
    pub duration: Duration,
}

impl ProcessOutput {
    /// Whether the process should be treated as a success: exited with
    /// code 0 and was neither cancelled nor timed out.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.reason, ExitReason::Exited(0))
    }
}

/// Shared cross-thread state for one running child, used by
/// [`ProcessHandle`] to act on a process a scheduler thread is waiting on.
#[derive(Debug)]
struct Shared {
    child: Mutex<Child>,
    paused: Mutex<bool>,
}

/// A spawned, possibly still-running child process.
///
/// `cancel`/`pause`/`resume` may be called from any thread while another
/// thread is blocked in [`ProcessHandle::wait`].
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    shared: Arc<Shared>,
    pid: u32,
}

impl ProcessHandle {
    /// Operating-system process id of the child (the process group leader
    /// on Unix).
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Send a termination signal to the whole process tree, escalating to
    /// a forceful kill if it hasn't exited after [`CANCEL_GRACE_PERIOD`].
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::Internal`] if the signal could not be delivered
    /// for a reason other than the process having already exited.
    pub fn cancel(&self) -> Result<(), ZrError> {
        imp::terminate(&self.shared, self.pid, CANCEL_GRACE_PERIOD)
    }

    /// Suspend the process tree (`SIGSTOP` on Unix). No-op if already
    /// paused.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::Internal`] on platforms without pause support,
    /// or if the signal could not be delivered.
    pub fn pause(&self) -> Result<(), ZrError> {
        imp::pause(&self.shared, self.pid)
    }

    /// Resume a paused process tree (`SIGCONT` on Unix). No-op if not
    /// paused.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::Internal`] on platforms without pause support,
    /// or if the signal could not be delivered.
    pub fn resume(&self) -> Result<(), ZrError> {
        imp::resume(&self.shared, self.pid)
    }
}

/// Spawns commands and captures their output.
#[derive(Debug, Clone, Copy)]
pub struct ProcessController {
    capture_limit: usize,
}

impl ProcessController {
    /// Build a controller that captures up to [`DEFAULT_CAPTURE_LIMIT`]
    /// bytes per stream.
    #[must_use]
    pub const fn new() -> Self {
        Self { capture_limit: DEFAULT_CAPTURE_LIMIT }
    }

    /// Build a controller with an explicit per-stream capture limit
    /// (tests use small limits to exercise truncation cheaply).
    #[must_use]
    pub const fn with_capture_limit(capture_limit: usize) -> Self {
        Self { capture_limit }
    }

    /// Spawn `cmd` as a shell command (`sh -c` on Unix, `cmd /C` on
    /// Windows), in its own process group, with stdout/stderr piped.
    ///
    /// The returned [`mpsc::Receiver`] yields exactly one [`ProcessOutput`]
    /// once the child exits; callers that need a timeout use
    /// `recv_timeout` on it directly rather than blocking forever.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::SpawnError`] if the process could not be
    /// started.
    pub fn spawn(
        &self,
        task_name: &str,
        cmd: &str,
        cwd: Option<&Path>,
        env: &[(String, String)],
    ) -> Result<(ProcessHandle, mpsc::Receiver<ProcessOutput>), ZrError> {
        let mut command = shell_command(cmd);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        for (k, v) in env {
            command.env(k, v);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        imp::detach(&mut command);

        let mut child = command.spawn().map_err(|source| ZrError::SpawnError {
            task: task_name.to_string(),
            source,
        })?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let shared = Arc::new(Shared {
            child: Mutex::new(child),
            paused: Mutex::new(false),
        });
        let handle = ProcessHandle { shared: shared.clone(), pid };

        let capture_limit = self.capture_limit;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let output = wait_and_capture(shared, stdout, stderr, capture_limit);
            let _ = tx.send(output);
        });
        Ok((handle, rx))
    }
}

impl Default for ProcessController {
    fn default() -> Self {
        Self::new()
    }
}

fn shell_command(cmd: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    }
}

fn wait_and_capture(
    shared: Arc<Shared>,
    stdout: Option<impl Read + Send + 'static>,
    stderr: Option<impl Read + Send + 'static>,
    capture_limit: usize,
) -> ProcessOutput {
    let start = Instant::now();
    let stdout_thread = spawn_reader(stdout, capture_limit);
    let stderr_thread = spawn_reader(stderr, capture_limit);

    let status = {
        let mut child = shared.child.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        child.wait()
    };

    let stdout = join_reader(stdout_thread);
    let stderr = join_reader(stderr_thread);
    let duration = start.elapsed();

    let reason = match status {
        Ok(status) => exit_reason_from_status(&status),
        Err(_) => ExitReason::Exited(-1),
    };

    ProcessOutput { reason, stdout, stderr, duration }
}

fn spawn_reader(
    stream: Option<impl Read + Send + 'static>,
    capture_limit: usize,
) -> Option<JoinHandle<RingBuffer>> {
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut buf = RingBuffer::new(capture_limit);
            let mut chunk = [0_u8; 8192];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(data) = chunk.get(..n) {
                            buf.push(data);
                        }
                    }
                    Err(_) => break,
                }
            }
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<RingBuffer>>) -> CapturedStream {
    handle
        .and_then(|h| h.join().ok())
        .map_or_else(CapturedStream::default, RingBuffer::into_captured)
}

#[cfg(unix)]
fn exit_reason_from_status(status: &std::process::ExitStatus) -> ExitReason {
    use std::os::unix::process::ExitStatusExt;
    status.code().map_or_else(
        || ExitReason::Signaled(status.signal().unwrap_or(-1)),
        ExitReason::Exited,
    )
}

#[cfg(not(unix))]
fn exit_reason_from_status(status: &std::process::ExitStatus) -> ExitReason {
    ExitReason::Exited(status.code().unwrap_or(-1))
}

#[cfg(unix)]
mod imp {
    use super::{CANCEL_GRACE_PERIOD, Shared};
    use crate::error::ZrError;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    use std::os::unix::process::CommandExt;
    use std::process::Command;
    use std::time::Duration;

    pub(super) fn detach(command: &mut Command) {
        command.process_group(0);
    }

    fn signal_group(pid: u32, sig: Signal) -> Result<(), ZrError> {
        let pgid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
        match signal::killpg(pgid, sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(ZrError::Internal(format!("signal {sig} to pgid {pid}: {e}"))),
        }
    }

    pub(super) fn terminate(shared: &Shared, pid: u32, grace: Duration) -> Result<(), ZrError> {
        signal_group(pid, Signal::SIGTERM)?;
        let deadline = std::time::Instant::now() + grace;
        loop {
            {
                let mut child = shared.child.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Ok(Some(_)) = child.try_wait() {
                    return Ok(());
                }
            }
            if std::time::Instant::now() >= deadline {
                return signal_group(pid, Signal::SIGKILL);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub(super) fn pause(shared: &Shared, pid: u32) -> Result<(), ZrError> {
        let mut paused = shared.paused.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if *paused {
            return Ok(());
        }
        signal_group(pid, Signal::SIGSTOP)?;
        *paused = true;
        Ok(())
    }

    pub(super) fn resume(shared: &Shared, pid: u32) -> Result<(), ZrError> {
        let mut paused = shared.paused.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !*paused {
            return Ok(());
        }
        signal_group(pid, Signal::SIGCONT)?;
        *paused = false;
        Ok(())
    }
}

#[cfg(not(unix))]
mod imp {
    use super::Shared;
    use crate::error::ZrError;
    use std::process::Command;
    use std::time::Duration;

    pub(super) fn detach(_command: &mut Command) {}

    pub(super) fn terminate(shared: &Shared, _pid: u32, _grace: Duration) -> Result<(), ZrError> {
        let mut child = shared.child.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        child
            .kill()
            .or_else(|e| if e.kind() == std::io::ErrorKind::InvalidInput { Ok(()) } else { Err(e) })
            .map_err(|e| ZrError::Internal(format!("killing pid {_pid}: {e}")))
    }

    pub(super) fn pause(_shared: &Shared, _pid: u32) -> Result<(), ZrError> {
        Err(ZrError::Internal("pause is not supported on this platform".to_string()))
    }

    pub(super) fn resume(_shared: &Shared, _pid: u32) -> Result<(), ZrError> {
        Err(ZrError::Internal("resume is not supported on this platform".to_string()))
    }
}
