//! Task catalogue: deserializes `zr.toml` into the in-memory [`TaskTable`]
//! the DAG and scheduler consume.
//!
//! Richer catalogue features (imports, templating, remote catalogues) are
//! out of scope; this module's job ends at handing the core engine a
//! validated `TaskTable`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A single task definition, as loaded from the catalogue.
///
/// Loaded once per invocation and never mutated; enforced simply by not
/// exposing any `&mut` accessors once a [`TaskTable`] is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    /// Shell command to execute.
    pub cmd: String,
    /// Ordered list of task names this task depends on.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Path globs resolved to input files for fingerprinting.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Paths this task is declared to produce.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Extra environment variables for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory override (relative to the catalogue's directory).
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Human-readable description, shown by `zr list`.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether successful runs may be cached. Defaults to `true` only when
    /// `outputs` is non-empty, matching the data model's default rule;
    /// an explicit `cache = false` always wins.
    pub cache: Option<bool>,
    /// Per-task wall-clock timeout.
    pub timeout_ms: Option<u64>,
    /// Number of times to retry a failing command before giving up.
    #[serde(default)]
    pub retries: u32,
}

impl Task {
    /// Whether this task's outputs should be committed to the cache on a
    /// successful run.
    #[must_use]
    pub fn cache_enabled(&self) -> bool {
        self.cache.unwrap_or(!self.outputs.is_empty())
    }
}

/// A named, ordered sequence of concurrent stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    /// Each inner list is a stage: task names run concurrently. Stages run
    /// sequentially; a stage fails if any member fails.
    pub stages: Vec<Vec<String>>,
}

/// Root shape of a `zr.toml` catalogue file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    tasks: HashMap<String, Task>,
    #[serde(default)]
    workflows: HashMap<String, Workflow>,
}

/// Validated, immutable collection of tasks and workflows for one
/// invocation.
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: HashMap<String, Task>,
    workflows: HashMap<String, Workflow>,
}

fn valid_task_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
}

impl TaskTable {
    /// Build a table directly from already-validated tasks and workflows,
    /// bypassing file I/O. Used by callers that construct catalogues
    /// programmatically (tests, embedders).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any task name is invalid, any task
    /// lists a duplicate dependency, or workflow validation fails.
    pub fn new(
        tasks: HashMap<String, Task>,
        workflows: HashMap<String, Workflow>,
    ) -> Result<Self, ConfigError> {
        for (name, task) in &tasks {
            if !valid_task_name(name) {
                return Err(ConfigError::InvalidTaskName(name.clone()));
            }
            let mut seen = HashSet::new();
            for dep in &task.deps {
                if !seen.insert(dep) {
                    return Err(ConfigError::DuplicateDependency {
                        task: name.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }
        Ok(Self { tasks, workflows })
    }

    /// Look up a task by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    /// Look up a workflow by name.
    #[must_use]
    pub fn workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }

    /// All task names, in no particular order.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// All `(name, task)` pairs.
    pub fn tasks(&self) -> impl Iterator<Item = (&str, &Task)> {
        self.tasks.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// All workflow names.
    pub fn workflow_names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }

    /// Number of tasks in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the table has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Load and validate a `zr.toml` catalogue from `path`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read,
/// [`ConfigError::InvalidSyntax`] if it is not valid TOML or does not
/// match the catalogue schema, and [`ConfigError::InvalidTaskName`] /
/// [`ConfigError::DuplicateDependency`] on validation failure.
pub fn load(path: &Path) -> Result<TaskTable, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_str(&content)
}

/// Load and validate a catalogue from an in-memory TOML string. Split out
/// from [`load`] so tests can exercise the schema without touching disk.
///
/// # Errors
///
/// See [`load`].
pub fn load_str(content: &str) -> Result<TaskTable, ConfigError> {
    let file: CatalogFile = toml::from_str(content).map_err(|e| ConfigError::InvalidSyntax {
        path: "<catalogue>".to_string(),
        message: e.to_string(),
    })?;
    TaskTable::new(file.tasks, file.workflows)
}
