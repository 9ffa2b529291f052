//! Typed error hierarchy for the execution engine.
//!
//! Internal modules return [`ZrError`] (or a more specific kind that
//! converts into it via `#[from]`); command handlers at the CLI boundary
//! convert to [`anyhow::Error`] via `?`. [`ZrError::exit_code`] draws the
//! line between kinds that abort the run before any task starts and kinds
//! that are per-task and only count toward the run's failure tally.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the execution engine.
#[derive(Error, Debug)]
pub enum ZrError {
    /// Task catalogue failed to load or validate.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A task name referenced on the command line does not exist.
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    /// A task declared a dependency that does not resolve to a known task.
    #[error("task '{task}' depends on unknown task '{dep}'")]
    UnknownDependency {
        /// Name of the task with the bad dependency.
        task: String,
        /// Name of the missing dependency.
        dep: String,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    CycleDetected {
        /// Ordered cycle path; first and last elements are equal.
        path: Vec<String>,
    },

    /// A declared input file is missing.
    #[error("task '{task}': input missing: {}", .path.display())]
    InputMissing {
        /// Name of the task whose input is missing.
        task: String,
        /// Path that could not be found.
        path: PathBuf,
    },

    /// The child process could not be spawned.
    #[error("failed to spawn '{task}': {source}")]
    SpawnError {
        /// Name of the task that failed to spawn.
        task: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The task exceeded its configured timeout.
    #[error("task '{0}' timed out")]
    TimedOut(String),

    /// The task (or the whole run) was cancelled.
    #[error("task '{0}' cancelled")]
    Cancelled(String),

    /// The task's command exited with a non-zero status.
    #[error("task '{task}' exited with code {code}")]
    NonZeroExit {
        /// Name of the failing task.
        task: String,
        /// Observed exit code.
        code: i32,
    },

    /// The content-addressed cache could not be read or written.
    #[error("cache I/O error: {0}")]
    CacheIoError(String),

    /// The history store could not be read or written.
    #[error("history I/O error: {0}")]
    HistoryIoError(String),

    /// An invariant was violated; always fatal.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ZrError {
    /// Exit code this error maps to at the process boundary, per the
    /// command surface's exit code table. Per-task errors that are only
    /// ever wrapped and reported (never returned directly to `main`) are
    /// not represented here.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::UnknownTask(_) | Self::UnknownDependency { .. } => 1,
            Self::CycleDetected { .. } => 2,
            Self::Cancelled(_) => 130,
            Self::TimedOut(_) => 124,
            Self::NonZeroExit { code, .. } => *code,
            Self::Internal(_) => 70,
            Self::InputMissing { .. } | Self::SpawnError { .. } => 1,
            Self::CacheIoError(_) | Self::HistoryIoError(_) => 1,
        }
    }
}

/// Errors that arise while loading and validating the task catalogue.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The catalogue file could not be read.
    #[error("cannot read catalogue {path}: {source}")]
    Io {
        /// Path to the catalogue file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The catalogue file is not valid TOML, or does not match the schema.
    #[error("invalid catalogue {path}: {message}")]
    InvalidSyntax {
        /// Path to the catalogue file.
        path: String,
        /// Parser-reported message.
        message: String,
    },

    /// A task name does not satisfy the allowed character class.
    #[error("invalid task name '{0}': must be non-empty ASCII alnum, '-', '_' or ':'")]
    InvalidTaskName(String),

    /// The same task name appears more than once in a task's `deps`.
    #[error("task '{task}' lists dependency '{dep}' more than once")]
    DuplicateDependency {
        /// Name of the task with the duplicate dependency entry.
        task: String,
        /// The duplicated dependency name.
        dep: String,
    },

    /// The same task name is defined more than once in the catalogue.
    #[error("task '{0}' is defined more than once")]
    DuplicateTask(String),
}
