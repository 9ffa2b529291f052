//! Shared helpers used by every command handler: state-root resolution,
//! catalogue loading, and input-glob expansion.

use std::path::{Path, PathBuf};

use crate::catalog::{Task, TaskTable};
use crate::error::ZrError;

/// Resolve the persisted state root: `--root`, else `$ZR_CACHE_DIR`, else
/// `$HOME/.zr` (`$USERPROFILE` on platforms without `HOME`).
///
/// # Errors
///
/// Returns [`ZrError::Config`] if no override is given and neither `HOME`
/// nor `USERPROFILE` is set.
pub fn state_root(explicit: Option<&Path>) -> Result<PathBuf, ZrError> {
    if let Some(root) = explicit {
        return Ok(root.to_path_buf());
    }
    if let Ok(dir) = std::env::var("ZR_CACHE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| {
            ZrError::Config(crate::error::ConfigError::Io {
                path: "$HOME".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "neither HOME nor USERPROFILE is set; pass --root explicitly",
                ),
            })
        })?;
    Ok(PathBuf::from(home).join(".zr"))
}

/// Resolve the catalogue path: `--file`, else `zr.toml` in the current
/// directory.
#[must_use]
pub fn catalog_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(|| PathBuf::from("zr.toml"), Path::to_path_buf)
}

/// Load and validate the task catalogue at `path`.
///
/// # Errors
///
/// Returns [`ZrError::Config`] if the file cannot be read or parsed, or
/// fails the catalogue's own validation (duplicate/invalid task names).
pub fn load_catalog(path: &Path) -> Result<TaskTable, ZrError> {
    crate::catalog::load(path).map_err(ZrError::from)
}

/// Resolve `--parallel`: an explicit non-zero value wins, otherwise
/// `$ZR_PARALLEL` is consulted, otherwise `0` (hardware concurrency).
#[must_use]
pub fn resolve_parallel(flag: usize) -> usize {
    if flag != 0 {
        return flag;
    }
    std::env::var("ZR_PARALLEL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Expand a task's declared `inputs` globs into a sorted, deduplicated
/// list of existing file paths, resolved relative to the task's `cwd`
/// (or the current directory).
///
/// # Errors
///
/// Returns [`ZrError::Internal`] if a glob pattern is malformed or cannot
/// be walked.
pub fn resolve_inputs(task: &Task) -> Result<Vec<PathBuf>, ZrError> {
    let base = task.cwd.clone();
    let mut paths = Vec::new();
    for pattern in &task.inputs {
        let full_pattern = base.as_ref().map_or_else(
            || pattern.clone(),
            |base| base.join(pattern).to_string_lossy().into_owned(),
        );
        let entries = glob::glob(&full_pattern)
            .map_err(|e| ZrError::Internal(format!("invalid glob '{pattern}': {e}")))?;
        for entry in entries {
            let path = entry.map_err(|e| ZrError::Internal(format!("walking glob: {e}")))?;
            if path.is_file() {
                paths.push(path);
            }
        }
    }
    paths.sort_unstable();
    paths.dedup();
    Ok(paths)
}

/// Borrowed `(name, value)` pairs over a task's declared environment.
#[must_use]
pub fn env_pairs(task: &Task) -> Vec<(&str, &str)> {
    task.env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}
