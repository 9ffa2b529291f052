//! `zr clean`: remove persisted state under the state root.
//!
//! Toolchains and plugins are not modules this build implements (the
//! catalogue has no notion of either); their flags are accepted for
//! command-surface compatibility but report nothing to remove.

use std::path::{Path, PathBuf};

use crate::cli::{Cli, CleanOpts};
use crate::error::ZrError;

use super::support;

struct Target {
    label: &'static str,
    path: PathBuf,
}

/// Entry point for `zr clean`: removes persisted state under the state root.
#[allow(clippy::print_stdout)]
pub fn run(cli: &Cli, opts: &CleanOpts) -> Result<i32, ZrError> {
    let state_root = support::state_root(cli.root.as_deref())?;

    let any_selector = opts.cache || opts.history || opts.toolchains || opts.plugins;
    let all = opts.all || !any_selector;

    let mut targets = Vec::new();
    if all || opts.cache {
        targets.push(Target { label: "cache", path: state_root.join("cache") });
    }
    if all || opts.history {
        targets.push(Target { label: "history", path: state_root.join("history.ndjson") });
    }
    if all || opts.toolchains {
        targets.push(Target { label: "toolchains", path: state_root.join("toolchains") });
    }
    if all || opts.plugins {
        targets.push(Target { label: "plugins", path: state_root.join("plugins") });
    }

    for target in &targets {
        if !target.path.exists() {
            continue;
        }
        if opts.dry_run {
            println!("would remove {} ({})", target.path.display(), target.label);
            continue;
        }
        remove(&target.path)?;
        println!("removed {} ({})", target.path.display(), target.label);
    }
    Ok(0)
}

fn remove(path: &Path) -> Result<(), ZrError> {
    let metadata = std::fs::symlink_metadata(path)
        .map_err(|e| ZrError::Internal(format!("stat {}: {e}", path.display())))?;
    if metadata.is_dir() {
        std::fs::remove_dir_all(path)
            .map_err(|e| ZrError::Internal(format!("removing {}: {e}", path.display())))?;
    } else {
        std::fs::remove_file(path)
            .map_err(|e| ZrError::Internal(format!("removing {}: {e}", path.display())))?;
    }
    Ok(())
}
