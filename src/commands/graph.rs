//! `zr graph`: print a task's (or workflow's) dependency graph as
//! topological execution levels.

use serde::Serialize;

use crate::cli::{Cli, GraphOpts};
use crate::dag::Dag;
use crate::error::ZrError;

use super::support;

#[derive(Debug, Serialize)]
struct GraphReport {
    levels: Vec<Vec<String>>,
}

/// Entry point for `zr graph`: prints a task's dependency graph as levels.
#[allow(clippy::print_stdout)]
pub fn run(cli: &Cli, opts: &GraphOpts) -> Result<i32, ZrError> {
    let table = support::load_catalog(&support::catalog_path(cli.file.as_deref()))?;

    let roots = if let Some(workflow) = table.workflow(&opts.task) {
        workflow.stages.iter().flatten().cloned().collect()
    } else {
        vec![opts.task.clone()]
    };

    let dag = Dag::build(&table, &roots)?;
    let levels = dag.levels()?;

    if opts.json {
        let report = GraphReport { levels };
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| ZrError::Internal(format!("serializing graph: {e}")))?;
        println!("{json}");
        return Ok(0);
    }

    for (i, level) in levels.iter().enumerate() {
        let mut names = level.clone();
        names.sort_unstable();
        println!("level {i}: {}", names.join(", "));
    }
    Ok(0)
}
